//! Destination registry.
//!
//! Maps each destination to the subscriptions on it, keyed by session. The
//! registry is plain data: it is owned by the hub actor and never shared, so
//! it needs no locking of its own.

use relay_transport::SessionId;
use std::collections::HashMap;
use tracing::debug;

use crate::subscription::Subscription;

/// Destination → session → subscription.
///
/// Destination entries are created on demand and never removed implicitly:
/// an empty entry stays a valid fan-out target.
#[derive(Debug, Default)]
pub struct Registry {
    destinations: HashMap<String, HashMap<SessionId, Subscription>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure an entry exists for `destination`.
    ///
    /// Returns `true` if the entry was created by this call.
    pub fn register(&mut self, destination: &str) -> bool {
        if self.destinations.contains_key(destination) {
            return false;
        }
        debug!(destination = %destination, "Creating destination");
        self.destinations
            .insert(destination.to_string(), HashMap::new());
        true
    }

    /// Check if a destination entry exists.
    #[must_use]
    pub fn contains_destination(&self, destination: &str) -> bool {
        self.destinations.contains_key(destination)
    }

    /// Look up the subscription of `session_id` on `destination`.
    #[must_use]
    pub fn get(&self, destination: &str, session_id: &SessionId) -> Option<&Subscription> {
        self.destinations
            .get(destination)
            .and_then(|subs| subs.get(session_id))
    }

    /// Mutable lookup of the subscription of `session_id` on `destination`.
    pub fn get_mut(
        &mut self,
        destination: &str,
        session_id: &SessionId,
    ) -> Option<&mut Subscription> {
        self.destinations
            .get_mut(destination)
            .and_then(|subs| subs.get_mut(session_id))
    }

    /// Store a subscription, creating its destination entry if needed.
    ///
    /// # Errors
    ///
    /// Hands the subscription back if its session already has one on the
    /// same destination.
    pub fn insert(&mut self, subscription: Subscription) -> Result<(), Subscription> {
        let subs = self
            .destinations
            .entry(subscription.destination().to_string())
            .or_default();

        if subs.contains_key(subscription.session_id()) {
            return Err(subscription);
        }
        subs.insert(subscription.session_id().clone(), subscription);
        Ok(())
    }

    /// Remove the subscription of `session_id` on `destination`.
    ///
    /// The destination entry is kept even if it becomes empty.
    pub fn remove(&mut self, destination: &str, session_id: &SessionId) -> Option<Subscription> {
        self.destinations
            .get_mut(destination)
            .and_then(|subs| subs.remove(session_id))
    }

    /// Remove every subscription owned by `session_id`.
    pub fn remove_session(&mut self, session_id: &SessionId) -> Vec<Subscription> {
        self.destinations
            .values_mut()
            .filter_map(|subs| subs.remove(session_id))
            .collect()
    }

    /// Subscriptions on `destination`, in no particular order.
    pub fn subscriptions(&self, destination: &str) -> impl Iterator<Item = &Subscription> {
        self.destinations
            .get(destination)
            .into_iter()
            .flat_map(|subs| subs.values())
    }

    /// Sessions subscribed to `destination`, or `None` if it is unknown.
    #[must_use]
    pub fn subscribers(&self, destination: &str) -> Option<Vec<SessionId>> {
        self.destinations
            .get(destination)
            .map(|subs| subs.keys().cloned().collect())
    }

    /// All destination names.
    #[must_use]
    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.keys().cloned().collect()
    }

    /// Number of destination entries.
    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Total number of subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.destinations.values().map(HashMap::len).sum()
    }

    /// Take every subscription out, leaving the destination entries empty.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.destinations
            .values_mut()
            .flat_map(|subs| subs.drain().map(|(_, sub)| sub))
            .collect()
    }
}
