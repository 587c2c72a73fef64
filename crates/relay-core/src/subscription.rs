//! Subscriptions and their delivery tasks.
//!
//! A subscription binds one session to one destination. It owns the outbound
//! queue the hub pushes encoded frames onto, and a delivery task that drains
//! that queue into the session in order. Closing the subscription drops the
//! queue's sender; the task finishes what is queued and exits.

use bytes::Bytes;
use relay_transport::{Session, SessionId};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A subscription identifier, unique per session.
pub type SubscriptionId = String;

/// Capacity policy for subscription queues.
///
/// This is the one place backpressure can reach a publisher, so it is a
/// configuration choice rather than a property of the channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Unbounded queue. Broadcast never waits; a slow subscriber grows
    /// memory without limit.
    #[default]
    Unbounded,
    /// Bounded queue. Broadcast waits for space, so a single slow subscriber
    /// stalls every publisher behind the hub.
    Blocking(usize),
    /// Bounded queue. When full, the frame is dropped for that subscriber
    /// only and counted.
    DropNewest(usize),
}

/// Outcome of pushing one frame onto a subscription queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The queue took the frame.
    Accepted,
    /// The queue was full and the frame was discarded.
    Dropped,
    /// The delivery task is gone.
    Closed,
}

enum Outbound {
    Unbounded(mpsc::UnboundedSender<Bytes>),
    Blocking(mpsc::Sender<Bytes>),
    DropNewest(mpsc::Sender<Bytes>),
}

enum Inbound {
    Unbounded(mpsc::UnboundedReceiver<Bytes>),
    Bounded(mpsc::Receiver<Bytes>),
}

impl Inbound {
    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Inbound::Unbounded(rx) => rx.recv().await,
            Inbound::Bounded(rx) => rx.recv().await,
        }
    }
}

fn queue(policy: QueuePolicy) -> (Outbound, Inbound) {
    match policy {
        QueuePolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Outbound::Unbounded(tx), Inbound::Unbounded(rx))
        }
        QueuePolicy::Blocking(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Outbound::Blocking(tx), Inbound::Bounded(rx))
        }
        QueuePolicy::DropNewest(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Outbound::DropNewest(tx), Inbound::Bounded(rx))
        }
    }
}

/// Counts delivery tasks that have not finished yet.
#[derive(Debug, Clone, Default)]
pub struct DeliveryTracker {
    active: Arc<AtomicUsize>,
}

impl DeliveryTracker {
    /// Number of live delivery tasks.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn start(&self) -> DeliveryGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        DeliveryGuard(self.active.clone())
    }
}

/// Decrements the tracker when a delivery task ends, however it ends.
struct DeliveryGuard(Arc<AtomicUsize>);

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A session's subscription to one destination.
pub struct Subscription {
    id: SubscriptionId,
    destination: String,
    session_id: SessionId,
    outbound: Outbound,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Create the subscription and start its delivery task.
    pub(crate) fn open(
        id: SubscriptionId,
        destination: String,
        session: Arc<dyn Session>,
        policy: QueuePolicy,
        tracker: &DeliveryTracker,
    ) -> Self {
        let session_id = session.id().clone();
        let (outbound, inbound) = queue(policy);
        let guard = tracker.start();

        let task = tokio::spawn(deliver(
            id.clone(),
            destination.clone(),
            session,
            inbound,
            guard,
        ));

        Self {
            id,
            destination,
            session_id,
            outbound,
            task,
        }
    }

    /// The subscription identifier stamped on delivered frames.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Change the id stamped on frames pushed from now on.
    pub(crate) fn rename(&mut self, id: SubscriptionId) {
        trace!(
            from = %self.id,
            to = %id,
            destination = %self.destination,
            session = %self.session_id,
            "Renaming subscription"
        );
        self.id = id;
    }

    /// The destination this subscription listens on.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The owning session.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Push one encoded frame according to the queue policy.
    pub(crate) async fn push(&self, data: Bytes) -> Enqueue {
        let result = match &self.outbound {
            Outbound::Unbounded(tx) => tx.send(data).map_err(|_| Enqueue::Closed),
            Outbound::Blocking(tx) => tx.send(data).await.map_err(|_| Enqueue::Closed),
            Outbound::DropNewest(tx) => tx.try_send(data).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Enqueue::Dropped,
                mpsc::error::TrySendError::Closed(_) => Enqueue::Closed,
            }),
        };
        result.err().unwrap_or(Enqueue::Accepted)
    }

    /// Close the queue.
    ///
    /// Consuming `self` makes a second close impossible. The returned handle
    /// resolves once the delivery task has drained the queue.
    pub(crate) fn close(self) -> JoinHandle<()> {
        trace!(
            subscription = %self.id,
            destination = %self.destination,
            session = %self.session_id,
            "Closing subscription queue"
        );
        drop(self.outbound);
        self.task
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Drain a subscription queue into its session.
async fn deliver(
    id: SubscriptionId,
    destination: String,
    session: Arc<dyn Session>,
    mut inbound: Inbound,
    _guard: DeliveryGuard,
) {
    debug!(
        subscription = %id,
        destination = %destination,
        session = %session.id(),
        "Delivery started"
    );

    while let Some(data) = inbound.recv().await {
        if let Err(e) = session.send(data).await {
            warn!(
                subscription = %id,
                destination = %destination,
                session = %session.id(),
                error = %e,
                "Delivery failed"
            );
            session.delivery_failed(&destination, &e);
        }
    }

    debug!(subscription = %id, destination = %destination, "Delivery finished");
}
