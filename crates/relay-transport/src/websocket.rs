//! WebSocket transport implementation.
//!
//! STOMP over WebSocket carries one or more frames per WebSocket message.
//! Upgrades are handled by axum; this module wraps the upgraded socket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, Frame, ProtocolError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ChannelSession;
use crate::traits::{Connection, Session, SessionId, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// A STOMP connection over an upgraded WebSocket.
///
/// Writes go through a [`ChannelSession`] drained by a dedicated writer task,
/// so the hub's delivery tasks and the connection loop never contend for the
/// socket.
pub struct WebSocketConnection {
    id: SessionId,
    session: Arc<ChannelSession>,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    remote_addr: Option<String>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket and start its writer task.
    #[must_use]
    pub fn new(socket: WebSocket, config: &WebSocketConfig) -> Self {
        let id = SessionId::generate();
        let (sink, stream) = socket.split();
        let (session, outbound) = ChannelSession::new(id.clone());
        let session = Arc::new(session);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = tokio::spawn(write_loop(
            id.clone(),
            sink,
            outbound,
            shutdown_rx,
            session.clone(),
        ));

        Self {
            id,
            session,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
            remote_addr: None,
            shutdown: Some(shutdown_tx),
            writer: Some(writer),
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl ToString) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    fn buffer(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.max_message_size {
            warn!(
                session = %self.id,
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(
                data.len(),
            )));
        }
        self.read_buffer.extend_from_slice(data);
        Ok(())
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
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

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => self.buffer(text.as_bytes())?,
                Some(Ok(Message::Binary(data))) => self.buffer(&data)?,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are queued by the socket itself.
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(session = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!(session = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(writer) = self.writer.take() {
            writer
                .await
                .map_err(|e| TransportError::Other(format!("Writer task failed: {}", e)))?;
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Drain the session channel into the socket until shutdown.
///
/// On shutdown whatever is already queued is flushed before the close frame.
async fn write_loop(
    id: SessionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: oneshot::Receiver<()>,
    session: Arc<ChannelSession>,
) {
    loop {
        tokio::select! {
            data = outbound.recv() => {
                let Some(data) = data else { break };
                if let Err(e) = sink.send(to_message(data)).await {
                    warn!(session = %id, error = %e, "WebSocket write failed");
                    session.close();
                    return;
                }
            }
            _ = &mut shutdown => {
                while let Ok(data) = outbound.try_recv() {
                    if sink.send(to_message(data)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    session.close();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!(session = %id, "WebSocket writer stopped");
}

/// STOMP frames are text unless the body is binary.
fn to_message(data: Bytes) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_message_text_and_binary() {
        let text = codec::encode(&Frame::send("/a", "hello")).unwrap();
        assert!(matches!(to_message(text), Message::Text(_)));

        let binary = codec::encode(&Frame::send("/a", vec![0xff, 0xfe])).unwrap();
        assert!(matches!(to_message(binary), Message::Binary(_)));
    }

    #[test]
    fn test_default_config() {
        assert_eq!(WebSocketConfig::default().max_message_size, 64 * 1024);
    }
}
