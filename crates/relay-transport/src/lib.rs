//! # relay-transport
//!
//! Session and connection abstractions for the Relay destination hub.
//!
//! - **Session** - the write half the hub delivers to
//! - **Connection** - the duplex handle owned by a client's read loop
//! - **Memory** - an in-process connection pair, for embedding and tests
//! - **WebSocket** - STOMP over an axum-upgraded WebSocket
//!
//! ```rust,ignore
//! use relay_transport::Connection;
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod channel;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::ChannelSession;
pub use memory::{MemoryClient, MemoryConnection};
pub use traits::{Connection, Session, SessionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
