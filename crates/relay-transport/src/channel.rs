//! Channel-backed session.
//!
//! Every transport in this crate funnels outbound bytes through an unbounded
//! mpsc channel whose receiver is drained by a single writer. That keeps the
//! socket owned by one task while the hub and the connection loop both write.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Session, SessionId, TransportError};

/// A [`Session`] that forwards writes into an mpsc channel.
#[derive(Debug)]
pub struct ChannelSession {
    id: SessionId,
    tx: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl ChannelSession {
    /// Create a session and the receiver its writes arrive on.
    #[must_use]
    pub fn new(id: SessionId) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            tx,
            closed: AtomicBool::new(false),
        };
        (session, rx)
    }

    /// Refuse all further writes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Check whether writes are still accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

#[async_trait]
impl Session for ChannelSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        trace!(session = %self.id, bytes = data.len(), "Queued outbound data");
        self.tx
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_session_send() {
        let (session, mut rx) = ChannelSession::new(SessionId::new("s1"));
        session.send(Bytes::from_static(b"one")).await.unwrap();
        session.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(&rx.recv().await.unwrap()[..], b"one");
        assert_eq!(&rx.recv().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_channel_session_closed() {
        let (session, rx) = ChannelSession::new(SessionId::new("s1"));
        session.close();
        assert!(!session.is_open());
        assert!(matches!(
            session.send(Bytes::new()).await,
            Err(TransportError::ConnectionClosed)
        ));

        let (session, rx2) = ChannelSession::new(SessionId::new("s2"));
        drop(rx2);
        assert!(session.send(Bytes::new()).await.is_err());
        drop(rx);
    }
}
