//! Frame types for the STOMP protocol.
//!
//! A frame is a command word, an ordered list of headers and an opaque body.
//! Frames are plain values: routing code copies them before annotating.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Well-known header names.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// STOMP command words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// The command as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Whether header values of this command are left unescaped on the wire.
    ///
    /// CONNECT and CONNECTED frames predate escaping and are exempt from it.
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            "CONNECTED" => Ok(Command::Connected),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(other.to_string()),
        }
    }
}

/// Ordered header list.
///
/// Repeated names are allowed on the wire; lookups return the first
/// occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the first value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    /// Set `name` to `value`.
    ///
    /// The first occurrence is replaced in place and any later duplicates are
    /// removed; if the header is absent it is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.entries.iter().position(|(k, _)| *k == name) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= pos || *k != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every occurrence of `name`, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self
            .entries
            .iter()
            .position(|(k, _)| k == name)
            .map(|pos| self.entries[pos].1.clone());
        self.entries.retain(|(k, _)| k != name);
        first
    }

    /// Iterate over headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command word.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Headers,
    /// Frame body.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The routing key of this frame, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.headers.get(header::DESTINATION)
    }

    /// Shorthand for a header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Create a CONNECT frame.
    #[must_use]
    pub fn connect(accept_version: &str, host: &str) -> Self {
        Frame::new(Command::Connect)
            .with_header(header::ACCEPT_VERSION, accept_version)
            .with_header(header::HOST, host)
    }

    /// Create a CONNECTED frame.
    #[must_use]
    pub fn connected(version: impl fmt::Display, session: &str, server: &str) -> Self {
        Frame::new(Command::Connected)
            .with_header(header::VERSION, version.to_string())
            .with_header(header::SERVER, server)
            .with_header(header::SESSION, session)
            .with_header(header::HEART_BEAT, "0,0")
    }

    /// Create a SEND frame.
    #[must_use]
    pub fn send(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Frame::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_body(body)
    }

    /// Create a SUBSCRIBE frame.
    #[must_use]
    pub fn subscribe(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Frame::new(Command::Subscribe)
            .with_header(header::ID, id)
            .with_header(header::DESTINATION, destination)
    }

    /// Create an UNSUBSCRIBE frame.
    #[must_use]
    pub fn unsubscribe(id: impl Into<String>) -> Self {
        Frame::new(Command::Unsubscribe).with_header(header::ID, id)
    }

    /// Create a MESSAGE frame.
    #[must_use]
    pub fn message(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Frame::new(Command::Message)
            .with_header(header::DESTINATION, destination)
            .with_body(body)
    }

    /// Create a RECEIPT frame.
    #[must_use]
    pub fn receipt(receipt_id: impl Into<String>) -> Self {
        Frame::new(Command::Receipt).with_header(header::RECEIPT_ID, receipt_id)
    }

    /// Create an ERROR frame with a short message and a detail body.
    #[must_use]
    pub fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail: String = detail.into();
        Frame::new(Command::Error)
            .with_header(header::MESSAGE, message)
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body(detail.into_bytes())
    }

    /// Create a DISCONNECT frame.
    #[must_use]
    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }
}
