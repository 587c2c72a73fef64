//! In-memory transport.
//!
//! [`pair`] returns a server-side [`Connection`] wired to a [`MemoryClient`]
//! peer. Both directions carry encoded STOMP bytes, so the connection loop
//! exercises the same codec path as over a socket.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_protocol::{codec, Frame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::ChannelSession;
use crate::traits::{Connection, Session, SessionId, TransportError};

/// Create a connected in-memory connection and client.
#[must_use]
pub fn pair(id: impl Into<SessionId>) -> (MemoryConnection, MemoryClient) {
    let id = id.into();
    let (session, outbound) = ChannelSession::new(id.clone());
    let (inbound_tx, inbound) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        id,
        session: Arc::new(session),
        inbound,
        read_buffer: BytesMut::with_capacity(4096),
    };
    let client = MemoryClient {
        tx: Some(inbound_tx),
        rx: outbound,
        read_buffer: BytesMut::with_capacity(4096),
    };
    (connection, client)
}

/// Server side of an in-memory pair.
pub struct MemoryConnection {
    id: SessionId,
    session: Arc<ChannelSession>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    read_buffer: BytesMut,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }
            match self.inbound.recv().await {
                Some(data) => self.read_buffer.extend_from_slice(&data),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!(session = %self.id, "Closing in-memory connection");
        self.session.close();
        self.inbound.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Client side of an in-memory pair.
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    read_buffer: BytesMut,
}

impl MemoryClient {
    /// Encode and send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the server side is gone.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_raw(codec::encode(frame)?)
    }

    /// Send raw bytes to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or the client hung up.
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(data.into())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written to this client.
    ///
    /// Returns `None` once every writer on the server side is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the server wrote bytes that do not decode.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }
            match self.rx.recv().await {
                Some(data) => self.read_buffer.extend_from_slice(&data),
                None => return Ok(None),
            }
        }
    }

    /// Hang up: the server's `recv` returns `None` once buffered frames
    /// are consumed.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}
