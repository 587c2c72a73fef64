//! # relay-core
//!
//! Destination registry and broadcast hub for the Relay message server.
//!
//! - **Hub** - the actor that serializes subscribe, unsubscribe, broadcast,
//!   and registration
//! - **Registry** - destination → session → subscription map owned by the hub
//! - **Subscription** - a per-subscriber queue and the task that drains it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands   ┌─────────────┐     ┌──────────────┐
//! │  HubHandle  │────────────▶│  Hub actor  │────▶│   Registry   │
//! └─────────────┘             └─────────────┘     └──────────────┘
//!                                    │ push
//!                                    ▼
//!                             ┌─────────────┐ send ┌─────────────┐
//!                             │ Subscription│─────▶│   Session   │
//!                             │   queue     │      └─────────────┘
//!                             └─────────────┘
//! ```
//!
//! ```rust,ignore
//! use relay_core::Hub;
//! use relay_protocol::Frame;
//!
//! let hub = Hub::spawn_default();
//! hub.subscribe("/topic/a", session).await?;
//! hub.broadcast(Frame::message("/topic/a", "hello")).await?;
//! ```

pub mod hub;
pub mod registry;
pub mod subscription;

pub use hub::{validate_destination, Hub, HubConfig, HubError, HubHandle, HubStats};
pub use registry::Registry;
pub use subscription::{DeliveryTracker, Enqueue, QueuePolicy, Subscription, SubscriptionId};
