//! # relay-protocol
//!
//! STOMP frame model and wire codec for the Relay destination hub.
//!
//! ## Frame Types
//!
//! - `CONNECT` / `CONNECTED` - Session handshake and version negotiation
//! - `SUBSCRIBE` / `UNSUBSCRIBE` - Destination membership
//! - `SEND` / `MESSAGE` - Publishing and delivery
//! - `RECEIPT` / `ERROR` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Frame};
//!
//! let frame = Frame::send("/topic/prices", "42");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.destination(), Some("/topic/prices"));
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{header, Command, Frame, Headers};
pub use version::{negotiate, Version, PROTOCOL_VERSION};
