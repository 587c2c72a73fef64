//! Transport abstraction traits for Relay.
//!
//! A [`Session`] is the write half of a connected client as seen by the hub:
//! it can be identified and written to, nothing else. A [`Connection`] is the
//! full duplex handle owned by the per-client loop, which reads frames from
//! it and hands out its session.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counter keeping generated ids unique within one nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("session_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The outbound capability of a connected client.
///
/// The hub holds sessions by `Arc` and only ever calls [`Session::id`] and
/// [`Session::send`]; closing the underlying connection stays with whoever
/// owns the [`Connection`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable unique identifier of the session.
    fn id(&self) -> &SessionId;

    /// Write one encoded frame. Best effort, no retry.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Called by the hub when a delivery to `destination` failed.
    ///
    /// The hub does not unsubscribe on failure; implementations that want to
    /// tear the client down do so from here or from their read loop.
    fn delivery_failed(&self, destination: &str, error: &TransportError) {
        let _ = (destination, error);
    }
}

/// An active connection over a transport.
///
/// Connections handle the inbound flow of frames from a single client and
/// expose the [`Session`] used for everything written back to it.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &SessionId;

    /// The write half shared with the hub.
    fn session(&self) -> Arc<dyn Session>;

    /// Receive the next frame from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
