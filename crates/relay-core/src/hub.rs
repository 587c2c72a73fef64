//! The destination hub.
//!
//! One actor task owns the [`Registry`] and processes every operation from a
//! single command channel, in arrival order. Mutations never interleave and a
//! broadcast always sees a complete subscriber set. Callers talk to the actor
//! through a cloneable [`HubHandle`]; each call waits for the actor's reply.

use relay_protocol::{codec, header, Frame, ProtocolError};
use relay_transport::{Session, SessionId};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::registry::Registry;
use crate::subscription::{DeliveryTracker, Enqueue, QueuePolicy, Subscription, SubscriptionId};

/// Maximum destination length.
pub const MAX_DESTINATION_LENGTH: usize = 1024;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid destination name.
    #[error("Invalid destination: {0}")]
    InvalidDestination(&'static str),

    /// Broadcast frame without a destination header.
    #[error("Frame has no destination header")]
    MissingDestination,

    /// The hub has shut down.
    #[error("Hub is shut down")]
    Closed,

    /// A frame could not be encoded for delivery.
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Validate a destination name.
///
/// # Errors
///
/// Returns an error message if the destination is empty, too long, or
/// contains control characters.
pub fn validate_destination(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Destination cannot be empty");
    }
    if name.len() > MAX_DESTINATION_LENGTH {
        return Err("Destination too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Destination contains control characters");
    }
    Ok(())
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity policy for every subscription queue.
    pub queue_policy: QueuePolicy,
    /// Depth of the command channel in front of the actor.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_policy: QueuePolicy::Unbounded,
            command_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of destination entries, including empty ones.
    pub destination_count: usize,
    /// Number of live subscriptions.
    pub subscription_count: usize,
    /// Delivery tasks still running, including ones draining after close.
    pub active_deliveries: usize,
    /// Frames discarded by a full `DropNewest` queue.
    pub dropped_frames: u64,
}

/// Operations sent to the actor.
enum Command {
    Subscribe {
        destination: String,
        session: Arc<dyn Session>,
        id: Option<SubscriptionId>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        destination: String,
        session_id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    UnsubscribeSession {
        session_id: SessionId,
        reply: oneshot::Sender<usize>,
    },
    Rename {
        destination: String,
        session_id: SessionId,
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        destination: String,
        frame: Frame,
        reply: oneshot::Sender<Result<usize, HubError>>,
    },
    RegisterDestination {
        destination: String,
        reply: oneshot::Sender<bool>,
    },
    Subscribers {
        destination: String,
        reply: oneshot::Sender<Option<Vec<SessionId>>>,
    },
    Destinations {
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The hub actor state.
pub struct Hub {
    registry: Registry,
    config: HubConfig,
    tracker: DeliveryTracker,
    next_subscription: u64,
    dropped_frames: u64,
}

impl Hub {
    /// Start a hub with default configuration.
    #[must_use]
    pub fn spawn_default() -> HubHandle {
        Self::spawn(HubConfig::default())
    }

    /// Start a hub actor on the current runtime.
    ///
    /// The actor runs until [`HubHandle::shutdown`] is called or every
    /// handle has been dropped; either way all subscriptions are closed and
    /// their delivery tasks awaited before it exits.
    #[must_use]
    pub fn spawn(config: HubConfig) -> HubHandle {
        info!("Starting hub with config: {:?}", config);
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Self {
            registry: Registry::new(),
            config,
            tracker: DeliveryTracker::default(),
            next_subscription: 0,
            dropped_frames: 0,
        };
        tokio::spawn(hub.run(rx));
        HubHandle { commands }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut shutdown_reply = None;

        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown { reply } => {
                    shutdown_reply = Some(reply);
                    break;
                }
                other => self.handle(other).await,
            }
        }

        commands.close();
        self.teardown().await;

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Hub stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                destination,
                session,
                id,
                reply,
            } => {
                let _ = reply.send(self.subscribe(destination, session, id));
            }
            Command::Unsubscribe {
                destination,
                session_id,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&destination, &session_id));
            }
            Command::UnsubscribeSession { session_id, reply } => {
                let _ = reply.send(self.unsubscribe_session(&session_id));
            }
            Command::Rename {
                destination,
                session_id,
                id,
                reply,
            } => {
                let renamed = match self.registry.get_mut(&destination, &session_id) {
                    Some(subscription) => {
                        subscription.rename(id);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(renamed);
            }
            Command::Broadcast {
                destination,
                frame,
                reply,
            } => {
                let result = self.broadcast(&destination, frame).await;
                let _ = reply.send(result);
            }
            Command::RegisterDestination { destination, reply } => {
                let _ = reply.send(self.registry.register(&destination));
            }
            Command::Subscribers { destination, reply } => {
                let _ = reply.send(self.registry.subscribers(&destination));
            }
            Command::Destinations { reply } => {
                let _ = reply.send(self.registry.destination_names());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn subscribe(
        &mut self,
        destination: String,
        session: Arc<dyn Session>,
        id: Option<SubscriptionId>,
    ) -> SubscriptionId {
        self.registry.register(&destination);

        if let Some(existing) = self.registry.get(&destination, session.id()) {
            debug!(
                destination = %destination,
                session = %session.id(),
                subscription = %existing.id(),
                "Already subscribed"
            );
            return existing.id().to_string();
        }

        let id = id.unwrap_or_else(|| self.next_subscription_id());
        let session_id = session.id().clone();
        let subscription = Subscription::open(
            id.clone(),
            destination.clone(),
            session,
            self.config.queue_policy,
            &self.tracker,
        );

        if let Err(rejected) = self.registry.insert(subscription) {
            drop(rejected.close());
        }

        debug!(
            destination = %destination,
            session = %session_id,
            subscription = %id,
            "Subscribed"
        );
        id
    }

    fn unsubscribe(&mut self, destination: &str, session_id: &SessionId) -> bool {
        match self.registry.remove(destination, session_id) {
            Some(subscription) => {
                debug!(
                    destination = %destination,
                    session = %session_id,
                    subscription = %subscription.id(),
                    "Unsubscribed"
                );
                // Detached: the task drains what is queued and exits.
                drop(subscription.close());
                true
            }
            None => {
                trace!(destination = %destination, session = %session_id, "Unsubscribe: not subscribed");
                false
            }
        }
    }

    fn unsubscribe_session(&mut self, session_id: &SessionId) -> usize {
        let removed = self.registry.remove_session(session_id);
        let count = removed.len();
        for subscription in removed {
            drop(subscription.close());
        }
        debug!(session = %session_id, subscriptions = count, "Unsubscribed session");
        count
    }

    async fn broadcast(&mut self, destination: &str, frame: Frame) -> Result<usize, HubError> {
        if self.registry.register(destination) {
            debug!(destination = %destination, "Broadcast to new destination, no subscribers");
            return Ok(0);
        }

        // Every copy is encoded before any is queued, so a frame that fails
        // for one subscriber reaches none of them.
        let copies = self
            .registry
            .subscriptions(destination)
            .map(|subscription| {
                let mut copy = frame.clone();
                copy.headers.set(header::SUBSCRIPTION, subscription.id());
                codec::encode(&copy).map(|data| (subscription, data))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!(destination = %destination, error = %e, "Broadcast rejected, nothing delivered");
                e
            })?;

        let mut delivered = 0;
        for (subscription, data) in copies {
            match subscription.push(data).await {
                Enqueue::Accepted => delivered += 1,
                Enqueue::Dropped => {
                    self.dropped_frames += 1;
                    warn!(
                        destination = %destination,
                        session = %subscription.session_id(),
                        "Subscription queue full, frame dropped"
                    );
                }
                Enqueue::Closed => {
                    warn!(
                        destination = %destination,
                        session = %subscription.session_id(),
                        "Delivery task gone, frame discarded"
                    );
                }
            }
        }

        trace!(destination = %destination, recipients = delivered, "Broadcast");
        Ok(delivered)
    }

    fn stats(&self) -> HubStats {
        HubStats {
            destination_count: self.registry.destination_count(),
            subscription_count: self.registry.subscription_count(),
            active_deliveries: self.tracker.active(),
            dropped_frames: self.dropped_frames,
        }
    }

    fn next_subscription_id(&mut self) -> SubscriptionId {
        self.next_subscription += 1;
        format!("sub-{}", self.next_subscription)
    }

    /// Close every subscription and wait for the delivery tasks to drain.
    async fn teardown(&mut self) {
        let subscriptions = self.registry.drain();
        info!(subscriptions = subscriptions.len(), "Closing all subscriptions");

        let tasks: Vec<_> = subscriptions.into_iter().map(Subscription::close).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Delivery task did not finish cleanly");
            }
        }
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Subscribe a session to a destination with a hub-allocated id.
    ///
    /// Subscribing a session twice to the same destination is a no-op that
    /// returns the existing subscription's id.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is invalid or the hub is closed.
    pub async fn subscribe(
        &self,
        destination: &str,
        session: Arc<dyn Session>,
    ) -> Result<SubscriptionId, HubError> {
        self.subscribe_inner(destination, session, None).await
    }

    /// Subscribe a session to a destination under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is invalid or the hub is closed.
    pub async fn subscribe_with_id(
        &self,
        destination: &str,
        session: Arc<dyn Session>,
        id: impl Into<SubscriptionId>,
    ) -> Result<SubscriptionId, HubError> {
        self.subscribe_inner(destination, session, Some(id.into()))
            .await
    }

    async fn subscribe_inner(
        &self,
        destination: &str,
        session: Arc<dyn Session>,
        id: Option<SubscriptionId>,
    ) -> Result<SubscriptionId, HubError> {
        validate_destination(destination).map_err(HubError::InvalidDestination)?;
        let destination = destination.to_string();
        self.request(|reply| Command::Subscribe {
            destination,
            session,
            id,
            reply,
        })
        .await
    }

    /// Remove a session's subscription to a destination.
    ///
    /// Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn unsubscribe(
        &self,
        destination: &str,
        session_id: &SessionId,
    ) -> Result<bool, HubError> {
        let destination = destination.to_string();
        let session_id = session_id.clone();
        self.request(|reply| Command::Unsubscribe {
            destination,
            session_id,
            reply,
        })
        .await
    }

    /// Remove every subscription of a session, e.g. when it disconnects.
    ///
    /// Returns the number of subscriptions removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn unsubscribe_session(&self, session_id: &SessionId) -> Result<usize, HubError> {
        let session_id = session_id.clone();
        self.request(|reply| Command::UnsubscribeSession { session_id, reply })
            .await
    }

    /// Change the id of a session's subscription to a destination.
    ///
    /// Frames broadcast after the call carry the new id; none are lost in
    /// between. Returns `false` if there is no such subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn rename_subscription(
        &self,
        destination: &str,
        session_id: &SessionId,
        id: impl Into<SubscriptionId>,
    ) -> Result<bool, HubError> {
        let destination = destination.to_string();
        let session_id = session_id.clone();
        let id = id.into();
        self.request(|reply| Command::Rename {
            destination,
            session_id,
            id,
            reply,
        })
        .await
    }

    /// Fan a frame out to every subscriber of its destination.
    ///
    /// Each subscriber receives its own copy with the `subscription` header
    /// set to its subscription id. Broadcasting to an unknown destination
    /// registers it and reaches nobody. Returns the number of queues that
    /// accepted the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame has no usable destination, cannot be
    /// encoded, or the hub is closed.
    pub async fn broadcast(&self, frame: Frame) -> Result<usize, HubError> {
        let destination = frame
            .destination()
            .ok_or(HubError::MissingDestination)?
            .to_string();
        validate_destination(&destination).map_err(HubError::InvalidDestination)?;

        self.request(|reply| Command::Broadcast {
            destination,
            frame,
            reply,
        })
        .await?
    }

    /// Create an empty destination entry ahead of any subscriber.
    ///
    /// Returns `true` if the entry did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is invalid or the hub is closed.
    pub async fn register_destination(&self, destination: &str) -> Result<bool, HubError> {
        validate_destination(destination).map_err(HubError::InvalidDestination)?;
        let destination = destination.to_string();
        self.request(|reply| Command::RegisterDestination { destination, reply })
            .await
    }

    /// Sessions subscribed to a destination, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn subscribers(&self, destination: &str) -> Result<Option<Vec<SessionId>>, HubError> {
        let destination = destination.to_string();
        self.request(|reply| Command::Subscribers { destination, reply })
            .await
    }

    /// Check whether a destination entry exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn has_destination(&self, destination: &str) -> Result<bool, HubError> {
        Ok(self.subscribers(destination).await?.is_some())
    }

    /// All known destinations.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn destinations(&self) -> Result<Vec<String>, HubError> {
        self.request(|reply| Command::Destinations { reply }).await
    }

    /// Get hub statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the hub, closing every subscription and waiting for queued
    /// frames to be written. Calling it on a stopped hub does nothing.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            trace!("Hub already shut down");
        }
    }

    /// Check whether the actor has stopped accepting commands.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_transport::{ChannelSession, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const WAIT: Duration = Duration::from_secs(2);

    fn session(id: &str) -> (Arc<ChannelSession>, mpsc::UnboundedReceiver<Bytes>) {
        let (session, rx) = ChannelSession::new(SessionId::new(id));
        (Arc::new(session), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Frame {
        let data = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("session channel closed");
        codec::decode(&data).unwrap()
    }

    async fn wait_for_idle(hub: &HubHandle) {
        tokio::time::timeout(WAIT, async {
            while hub.stats().await.unwrap().active_deliveries > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delivery tasks did not finish");
    }

    /// Session whose writes always fail.
    struct BrokenSession {
        id: SessionId,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Session for BrokenSession {
        fn id(&self) -> &SessionId {
            &self.id
        }

        async fn send(&self, _data: Bytes) -> Result<(), TransportError> {
            Err(TransportError::SendFailed("broken pipe".to_string()))
        }

        fn delivery_failed(&self, _destination: &str, _error: &TransportError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Session whose writes wait for a permit.
    struct GatedSession {
        inner: ChannelSession,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Session for GatedSession {
        fn id(&self) -> &SessionId {
            self.inner.id()
        }

        async fn send(&self, data: Bytes) -> Result<(), TransportError> {
            self.gate
                .acquire()
                .await
                .map_err(|_| TransportError::ConnectionClosed)?
                .forget();
            self.inner.send(data).await
        }
    }

    fn gated(id: &str) -> (Arc<GatedSession>, Arc<Semaphore>, mpsc::UnboundedReceiver<Bytes>) {
        let (inner, rx) = ChannelSession::new(SessionId::new(id));
        let gate = Arc::new(Semaphore::new(0));
        let session = Arc::new(GatedSession {
            inner,
            gate: gate.clone(),
        });
        (session, gate, rx)
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let hub = Hub::spawn_default();
        let (s1, _rx) = session("s1");

        let first = hub.subscribe("/topic/a", s1.clone()).await.unwrap();
        let second = hub.subscribe("/topic/a", s1.clone()).await.unwrap();
        assert_eq!(first, second);

        let subscribers = hub.subscribers("/topic/a").await.unwrap().unwrap();
        assert_eq!(subscribers, vec![SessionId::new("s1")]);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.subscription_count, 1);
        assert_eq!(stats.active_deliveries, 1);
    }

    #[tokio::test]
    async fn test_subscribe_with_id_keeps_first_id() {
        let hub = Hub::spawn_default();
        let (s1, _rx) = session("s1");

        let id = hub.subscribe_with_id("/topic/a", s1.clone(), "client-7").await.unwrap();
        assert_eq!(id, "client-7");
        let again = hub.subscribe_with_id("/topic/a", s1, "client-8").await.unwrap();
        assert_eq!(again, "client-7");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = Hub::spawn_default();
        let (s1, _rx) = session("s1");
        let s1_id = SessionId::new("s1");

        assert!(!hub.unsubscribe("/topic/a", &s1_id).await.unwrap());

        hub.subscribe("/topic/a", s1).await.unwrap();
        assert!(hub.unsubscribe("/topic/a", &s1_id).await.unwrap());
        assert!(!hub.unsubscribe("/topic/a", &s1_id).await.unwrap());

        // The entry outlives its last subscriber.
        assert_eq!(hub.subscribers("/topic/a").await.unwrap(), Some(vec![]));
        wait_for_idle(&hub).await;
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let hub = Hub::spawn_default();
        let (s1, mut rx) = session("s1");
        hub.subscribe("/topic/a", s1).await.unwrap();

        for i in 0..100 {
            hub.broadcast(Frame::message("/topic/a", i.to_string()))
                .await
                .unwrap();
        }
        for i in 0..100 {
            let frame = next_frame(&mut rx).await;
            assert_eq!(frame.body, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_destinations_are_isolated() {
        let hub = Hub::spawn_default();
        let (s1, mut rx) = session("s1");
        hub.subscribe("A", s1).await.unwrap();
        hub.register_destination("B").await.unwrap();

        assert_eq!(hub.broadcast(Frame::message("B", "for b")).await.unwrap(), 0);
        assert_eq!(hub.broadcast(Frame::message("A", "for a")).await.unwrap(), 1);

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.destination(), Some("A"));
        assert_eq!(&frame.body[..], b"for a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_registers_unknown_destination() {
        let hub = Hub::spawn_default();
        assert!(!hub.has_destination("/topic/new").await.unwrap());

        let recipients = hub
            .broadcast(Frame::message("/topic/new", "nobody"))
            .await
            .unwrap();
        assert_eq!(recipients, 0);
        assert!(hub.has_destination("/topic/new").await.unwrap());
        assert_eq!(hub.subscribers("/topic/new").await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_broadcast_stamps_each_copy() {
        let hub = Hub::spawn_default();
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        let id1 = hub.subscribe("/topic/a", s1).await.unwrap();
        let id2 = hub.subscribe("/topic/a", s2).await.unwrap();
        assert_ne!(id1, id2);

        let frame = Frame::message("/topic/a", "hello").with_header(header::SUBSCRIPTION, "stale");
        assert_eq!(hub.broadcast(frame.clone()).await.unwrap(), 2);
        assert_eq!(frame.header(header::SUBSCRIPTION), Some("stale"));

        let got1 = next_frame(&mut rx1).await;
        let got2 = next_frame(&mut rx2).await;
        assert_eq!(got1.header(header::SUBSCRIPTION), Some(id1.as_str()));
        assert_eq!(got2.header(header::SUBSCRIPTION), Some(id2.as_str()));
        assert_eq!(got1.headers.iter().filter(|(k, _)| *k == header::SUBSCRIPTION).count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_copy_aborts_whole_broadcast() {
        let hub = Hub::spawn_default();
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        hub.subscribe_with_id("/topic/a", s1, "s").await.unwrap();
        hub.subscribe_with_id("/topic/a", s2, "s".repeat(64)).await.unwrap();

        // Size the body so the copy stamped "s" is exactly at the limit and
        // the copy with the longer id is over it.
        let base_body = codec::MAX_FRAME_SIZE - 1000;
        let sized = Frame::message("/topic/a", vec![b'x'; base_body])
            .with_header(header::SUBSCRIPTION, "s");
        let overhead = codec::encode(&sized).unwrap().len() - base_body;
        let frame = Frame::message("/topic/a", vec![b'x'; codec::MAX_FRAME_SIZE - overhead]);

        assert!(matches!(
            hub.broadcast(frame).await,
            Err(HubError::Encode(ProtocolError::FrameTooLarge(_)))
        ));

        hub.broadcast(Frame::message("/topic/a", "small")).await.unwrap();
        assert_eq!(&next_frame(&mut rx1).await.body[..], b"small");
        assert_eq!(&next_frame(&mut rx2).await.body[..], b"small");
    }

    #[tokio::test]
    async fn test_rename_subscription_restamps_copies() {
        let hub = Hub::spawn_default();
        let (s1, mut rx) = session("s1");
        let s1_id = SessionId::new("s1");
        hub.subscribe_with_id("/topic/a", s1, "first").await.unwrap();

        hub.broadcast(Frame::message("/topic/a", "1")).await.unwrap();
        assert!(hub.rename_subscription("/topic/a", &s1_id, "second").await.unwrap());
        hub.broadcast(Frame::message("/topic/a", "2")).await.unwrap();

        assert_eq!(next_frame(&mut rx).await.header(header::SUBSCRIPTION), Some("first"));
        assert_eq!(next_frame(&mut rx).await.header(header::SUBSCRIPTION), Some("second"));
        assert!(!hub.rename_subscription("/topic/b", &s1_id, "third").await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_rejects_missing_destination() {
        let hub = Hub::spawn_default();

        assert!(matches!(
            hub.broadcast(Frame::message("", "x")).await,
            Err(HubError::InvalidDestination(_))
        ));
        assert!(matches!(
            hub.broadcast(Frame::new(relay_protocol::Command::Message)).await,
            Err(HubError::MissingDestination)
        ));
        assert!(matches!(
            hub.subscribe("", session("s1").0).await,
            Err(HubError::InvalidDestination(_))
        ));
        assert!(hub.destinations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let hub = Hub::spawn_default();
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");

        hub.subscribe("/topic/a", s1).await.unwrap();
        hub.subscribe("/topic/a", s2).await.unwrap();
        hub.broadcast(Frame::message("/topic/a", "hello")).await.unwrap();

        let got1 = next_frame(&mut rx1).await;
        let got2 = next_frame(&mut rx2).await;
        assert_eq!(&got1.body[..], b"hello");
        assert_eq!(&got2.body[..], b"hello");
        assert_ne!(
            got1.header(header::SUBSCRIPTION),
            got2.header(header::SUBSCRIPTION)
        );

        hub.unsubscribe("/topic/a", &SessionId::new("s1")).await.unwrap();
        hub.broadcast(Frame::message("/topic/a", "second")).await.unwrap();

        let got2 = next_frame(&mut rx2).await;
        assert_eq!(&got2.body[..], b"second");
        wait_for_idle_except(&hub, 1).await;
        assert!(rx1.try_recv().is_err());
    }

    async fn wait_for_idle_except(hub: &HubHandle, remaining: usize) {
        tokio::time::timeout(WAIT, async {
            while hub.stats().await.unwrap().active_deliveries > remaining {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delivery tasks did not finish");
    }

    #[tokio::test]
    async fn test_unsubscribe_session_keeps_destinations() {
        let hub = Hub::spawn_default();
        let (s1, _rx1) = session("s1");
        let (s2, _rx2) = session("s2");
        hub.subscribe("/topic/a", s1.clone()).await.unwrap();
        hub.subscribe("/topic/b", s1).await.unwrap();
        hub.subscribe("/topic/a", s2).await.unwrap();

        let removed = hub.unsubscribe_session(&SessionId::new("s1")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            hub.subscribers("/topic/a").await.unwrap(),
            Some(vec![SessionId::new("s2")])
        );
        assert_eq!(hub.subscribers("/topic/b").await.unwrap(), Some(vec![]));
        assert_eq!(hub.unsubscribe_session(&SessionId::new("s1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_session_does_not_affect_others() {
        let hub = Hub::spawn_default();
        let broken = Arc::new(BrokenSession {
            id: SessionId::new("broken"),
            failures: AtomicUsize::new(0),
        });
        let (good, mut rx) = session("good");

        hub.subscribe("/topic/a", broken.clone()).await.unwrap();
        hub.subscribe("/topic/a", good).await.unwrap();
        assert_eq!(hub.broadcast(Frame::message("/topic/a", "x")).await.unwrap(), 2);

        assert_eq!(&next_frame(&mut rx).await.body[..], b"x");
        tokio::time::timeout(WAIT, async {
            while broken.failures.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The failing subscriber stays registered until someone removes it.
        assert_eq!(hub.subscribers("/topic/a").await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_policy_applies_backpressure() {
        let hub = Hub::spawn(HubConfig {
            queue_policy: QueuePolicy::Blocking(1),
            ..Default::default()
        });
        let (slow, gate, mut rx) = gated("slow");
        hub.subscribe("/topic/a", slow).await.unwrap();

        let publisher = hub.clone();
        let publishing = tokio::spawn(async move {
            for i in 0..3 {
                publisher
                    .broadcast(Frame::message("/topic/a", i.to_string()))
                    .await
                    .unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!publishing.is_finished());

        gate.add_permits(3);
        tokio::time::timeout(WAIT, publishing).await.unwrap().unwrap();
        for i in 0..3 {
            assert_eq!(next_frame(&mut rx).await.body, Bytes::from(i.to_string()));
        }
        assert_eq!(hub.stats().await.unwrap().dropped_frames, 0);
    }

    #[tokio::test]
    async fn test_drop_newest_policy_sheds_load() {
        let hub = Hub::spawn(HubConfig {
            queue_policy: QueuePolicy::DropNewest(1),
            ..Default::default()
        });
        let (slow, gate, _rx) = gated("slow");
        let (fast, mut fast_rx) = session("fast");
        hub.subscribe("/topic/a", slow).await.unwrap();
        hub.subscribe("/topic/a", fast).await.unwrap();

        let mut accepted = 0;
        for i in 0..3 {
            let frame = Frame::message("/topic/a", i.to_string());
            accepted += tokio::time::timeout(WAIT, hub.broadcast(frame))
                .await
                .unwrap()
                .unwrap();
        }

        let stats = hub.stats().await.unwrap();
        assert!(stats.dropped_frames >= 1);
        assert_eq!(accepted as u64 + stats.dropped_frames, 6);
        for i in 0..3 {
            assert_eq!(next_frame(&mut fast_rx).await.body, Bytes::from(i.to_string()));
        }
        gate.close();
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let hub = Hub::spawn_default();
        let (s1, mut rx) = session("s1");
        hub.subscribe("/topic/a", s1).await.unwrap();
        hub.broadcast(Frame::message("/topic/a", "last")).await.unwrap();

        hub.shutdown().await;

        assert_eq!(&codec::decode(&rx.try_recv().unwrap()).unwrap().body[..], b"last");
        assert!(hub.is_closed());
        assert!(matches!(hub.stats().await, Err(HubError::Closed)));
        assert!(matches!(
            hub.subscribe("/topic/a", session("s2").0).await,
            Err(HubError::Closed)
        ));
        hub.shutdown().await;
    }

    #[test]
    fn test_destination_validation() {
        assert!(validate_destination("/topic/a").is_ok());
        assert!(validate_destination("").is_err());
        assert!(validate_destination("/topic/\n").is_err());
        assert!(validate_destination(&"a".repeat(MAX_DESTINATION_LENGTH + 1)).is_err());
    }
}
