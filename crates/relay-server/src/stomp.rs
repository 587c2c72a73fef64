//! STOMP session handling.
//!
//! One [`StompSession`] runs per client connection. It performs the CONNECT
//! handshake, turns SUBSCRIBE, UNSUBSCRIBE and SEND into hub operations, and
//! answers receipts. Any protocol violation is reported with an ERROR frame
//! and ends the session; whatever the reason for ending, the session's
//! subscriptions are removed from the hub.

use relay_core::{HubError, HubHandle};
use relay_protocol::version::SUPPORTED_VERSIONS;
use relay_protocol::{codec, header, negotiate, Command, Frame, Version};
use relay_transport::{Connection, Session, SessionId, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::metrics::{self, SessionMetricsGuard};

/// Value of the `server` header in CONNECTED frames.
pub const SERVER_NAME: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));

/// Reasons a session ends abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client broke the protocol.
    #[error("{message}: {detail}")]
    Rejected { message: String, detail: String },

    /// The connection failed or sent undecodable bytes.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The hub refused the request or is gone.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}

impl SessionError {
    fn rejected(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            detail: detail.into(),
        }
    }

    fn missing_header(command: Command, name: &str) -> Self {
        Self::rejected(
            "Missing header",
            format!("{command} requires a '{name}' header"),
        )
    }

    /// Label used for the error counter.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "protocol",
            Self::Transport(TransportError::Protocol(_)) => "decode",
            Self::Transport(_) => "transport",
            Self::Hub(_) => "hub",
        }
    }

    /// The ERROR frame to send before closing, if the peer can still hear it.
    #[must_use]
    pub fn to_frame(&self) -> Option<Frame> {
        match self {
            Self::Rejected { message, detail } => Some(Frame::error(message, detail)),
            Self::Transport(TransportError::Protocol(e)) => {
                Some(Frame::error("Malformed frame", e.to_string()))
            }
            Self::Transport(_) => None,
            Self::Hub(HubError::Closed) => Some(Frame::error(
                "Server shutting down",
                "The server is no longer accepting requests",
            )),
            Self::Hub(e) => Some(Frame::error("Request rejected", e.to_string())),
        }
    }
}

enum Flow {
    Continue,
    Disconnect,
}

/// Protocol state of one client connection.
pub struct StompSession {
    id: SessionId,
    hub: HubHandle,
    session: Arc<dyn Session>,
    version: Option<Version>,
    /// Client subscription id → destination.
    subscriptions: HashMap<String, String>,
    /// Destination → id the hub stamps on its MESSAGE frames.
    stamped: HashMap<String, String>,
    next_message: u64,
}

/// Run a STOMP session over `connection` until it ends, then clean up.
pub async fn serve_connection<C: Connection>(mut connection: C, hub: HubHandle) {
    let _metrics_guard = SessionMetricsGuard::new();
    let mut session = StompSession::new(connection.id().clone(), connection.session(), hub);

    debug!(
        session = %session.id,
        remote = connection.remote_addr().as_deref().unwrap_or("unknown"),
        "Session opened"
    );

    if let Err(e) = session.run(&mut connection).await {
        warn!(session = %session.id, error = %e, "Session ended with error");
        metrics::record_error(e.kind());
        if let Some(frame) = e.to_frame() {
            if let Err(e) = session.reply(&frame).await {
                debug!(session = %session.id, error = %e, "Could not deliver ERROR frame");
            }
        }
    }

    session.finish().await;

    if let Err(e) = connection.close().await {
        debug!(session = %session.id, error = %e, "Error closing connection");
    }
    debug!(session = %session.id, "Session closed");
}

impl StompSession {
    /// Create the state for a freshly accepted connection.
    #[must_use]
    pub fn new(id: SessionId, session: Arc<dyn Session>, hub: HubHandle) -> Self {
        Self {
            id,
            hub,
            session,
            version: None,
            subscriptions: HashMap::new(),
            stamped: HashMap::new(),
            next_message: 0,
        }
    }

    async fn run<C: Connection>(&mut self, connection: &mut C) -> Result<(), SessionError> {
        while let Some(frame) = connection.recv().await? {
            metrics::record_inbound(frame.command.as_str());
            trace!(session = %self.id, command = %frame.command, "Frame received");

            let receipt = frame.header(header::RECEIPT).map(str::to_string);
            let flow = self.handle(frame).await?;

            if let Some(receipt) = receipt {
                self.reply(&Frame::receipt(receipt)).await?;
            }
            if let Flow::Disconnect = flow {
                debug!(session = %self.id, "Client disconnected");
                return Ok(());
            }
        }

        debug!(session = %self.id, "Connection closed by peer");
        Ok(())
    }

    async fn handle(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        match (frame.command, self.version) {
            (Command::Connect | Command::Stomp, None) => self.connect(&frame).await?,
            (Command::Connect | Command::Stomp, Some(_)) => {
                return Err(SessionError::rejected(
                    "Already connected",
                    "CONNECT may only be sent once",
                ));
            }
            (command, None) => {
                return Err(SessionError::rejected(
                    "Not connected",
                    format!("Expected CONNECT or STOMP, got {command}"),
                ));
            }
            (Command::Subscribe, Some(_)) => self.subscribe(&frame).await?,
            (Command::Unsubscribe, Some(_)) => self.unsubscribe(&frame).await?,
            (Command::Send, Some(_)) => self.send(frame).await?,
            (Command::Ack | Command::Nack, Some(_)) => {
                // Every subscription is auto-acknowledged.
                trace!(session = %self.id, "Ignoring acknowledgement");
            }
            (Command::Begin | Command::Commit | Command::Abort, Some(_)) => {
                return Err(SessionError::rejected(
                    "Transactions are not supported",
                    format!("{} is not supported by this server", frame.command),
                ));
            }
            (Command::Disconnect, Some(_)) => return Ok(Flow::Disconnect),
            (command, Some(_)) => {
                return Err(SessionError::rejected(
                    "Unexpected frame",
                    format!("{command} is a server frame"),
                ));
            }
        }
        Ok(Flow::Continue)
    }

    async fn connect(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let version = negotiate(frame.header(header::ACCEPT_VERSION)).ok_or_else(|| {
            let supported: Vec<String> = SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect();
            SessionError::rejected(
                "Unsupported protocol version",
                format!("Supported protocol versions are {}", supported.join(",")),
            )
        })?;

        self.version = Some(version);
        self.reply(&Frame::connected(version, self.id.as_str(), SERVER_NAME))
            .await?;

        info!(session = %self.id, version = %version, "Session connected");
        Ok(())
    }

    async fn subscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let destination = frame
            .destination()
            .ok_or_else(|| SessionError::missing_header(Command::Subscribe, header::DESTINATION))?
            .to_string();
        let requested = frame.header(header::ID).map(str::to_string);

        if let Some(id) = &requested {
            if self.subscriptions.contains_key(id) {
                return Err(SessionError::rejected(
                    "Duplicate subscription",
                    format!("Subscription id '{id}' is already in use"),
                ));
            }
        }

        let assigned = match &requested {
            Some(id) => {
                self.hub
                    .subscribe_with_id(&destination, self.session.clone(), id.as_str())
                    .await?
            }
            None => self.hub.subscribe(&destination, self.session.clone()).await?,
        };

        if requested.as_deref().is_some_and(|id| id != assigned) {
            debug!(
                session = %self.id,
                destination = %destination,
                subscription = %assigned,
                "Already subscribed under another id"
            );
        }

        debug!(session = %self.id, destination = %destination, subscription = %assigned, "Subscribed");
        self.stamped.insert(destination.clone(), assigned.clone());
        self.subscriptions
            .insert(requested.unwrap_or(assigned), destination);
        self.update_destination_gauge().await;
        Ok(())
    }

    async fn unsubscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let (destination, removed) = match (frame.header(header::ID), frame.destination()) {
            (Some(id), _) => match self.subscriptions.remove(id) {
                Some(destination) => (destination, Some(id)),
                None => {
                    debug!(session = %self.id, subscription = %id, "Unsubscribe for unknown id");
                    return Ok(());
                }
            },
            // 1.0 clients may unsubscribe by destination.
            (None, Some(destination)) => {
                let destination = destination.to_string();
                self.subscriptions.retain(|_, d| *d != destination);
                (destination, None)
            }
            (None, None) => {
                return Err(SessionError::missing_header(Command::Unsubscribe, header::ID));
            }
        };

        // Another client id may still point at the same hub subscription.
        let survivor = self
            .subscriptions
            .iter()
            .find(|(_, d)| **d == destination)
            .map(|(id, _)| id.clone());

        let Some(survivor) = survivor else {
            self.stamped.remove(&destination);
            self.hub.unsubscribe(&destination, &self.id).await?;
            debug!(session = %self.id, destination = %destination, "Unsubscribed");
            return Ok(());
        };

        // Deliveries must stop carrying the id the client just released.
        if removed.is_some() && self.stamped.get(&destination).map(String::as_str) == removed {
            self.hub
                .rename_subscription(&destination, &self.id, survivor.as_str())
                .await?;
            debug!(
                session = %self.id,
                destination = %destination,
                subscription = %survivor,
                "Subscription taken over by remaining id"
            );
            self.stamped.insert(destination, survivor);
        }
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        if frame.destination().is_none() {
            return Err(SessionError::missing_header(Command::Send, header::DESTINATION));
        }

        self.next_message += 1;
        let mut message = Frame {
            command: Command::Message,
            headers: frame.headers,
            body: frame.body,
        };
        message.headers.remove(header::RECEIPT);
        message
            .headers
            .set(header::MESSAGE_ID, format!("{}-{}", self.id, self.next_message));

        let recipients = self.hub.broadcast(message).await?;
        metrics::record_broadcast(recipients);
        trace!(session = %self.id, recipients, "Message broadcast");

        self.update_destination_gauge().await;
        Ok(())
    }

    /// Write a frame to this client.
    async fn reply(&self, frame: &Frame) -> Result<(), SessionError> {
        let data = codec::encode(frame).map_err(TransportError::from)?;
        metrics::record_outbound(frame.command.as_str(), data.len());
        self.session.send(data).await?;
        Ok(())
    }

    async fn update_destination_gauge(&self) {
        if let Ok(stats) = self.hub.stats().await {
            metrics::set_active_destinations(stats.destination_count);
        }
    }

    /// Drop every hub subscription of this session.
    async fn finish(&mut self) {
        self.subscriptions.clear();
        self.stamped.clear();
        match self.hub.unsubscribe_session(&self.id).await {
            Ok(removed) => {
                debug!(session = %self.id, subscriptions = removed, "Session subscriptions removed");
            }
            Err(e) => debug!(session = %self.id, error = %e, "Hub unavailable during cleanup"),
        }
    }
}
