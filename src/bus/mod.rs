//! Message bus: the publish/subscribe capability the hub runs on.
//!
//! This module contains:
//! - `MessageBus` trait: publish frames, subscribe queues, add bindings
//! - `Frame`: one raw payload as it travels over the bus
//! - Implementations: in-process channel (offline mode), AMQP (RabbitMQ), Mock
//!
//! The hub depends only on this capability, never on a wire protocol.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBus, AmqpConfig};
pub use channel::ChannelBus;
pub use mock::MockBus;

/// Content type of every frame the codec produces.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Default broker exchange for requests and replies.
pub const DEFAULT_REQUESTS_EXCHANGE: &str = "requests";
/// Default broker exchange for alerts.
pub const DEFAULT_ALERTS_EXCHANGE: &str = "alerts";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

// ============================================================================
// Types
// ============================================================================

/// The two exchanges every service shares.
///
/// Requests and replies travel on `Requests`; alerts (including heartbeats)
/// on `Alerts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Requests,
    Alerts,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requests => f.write_str("requests"),
            Self::Alerts => f.write_str("alerts"),
        }
    }
}

/// Broker connectivity as seen by a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Lost,
}

/// One raw payload on the bus.
///
/// `message_id` has the form `<stream>/<chunk-index>/<chunk-count>`; frames
/// sharing a stream id are chunks of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub routing_key: String,
    pub message_id: String,
    pub content_type: String,
    pub body: Bytes,
}

impl Frame {
    pub fn new(
        routing_key: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            message_id: message_id.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: body.into(),
        }
    }
}

/// A queue to consume, with the bindings that feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub exchange: Exchange,
    pub bindings: Vec<String>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, exchange: Exchange) -> Self {
        Self {
            queue: queue.into(),
            exchange,
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, binding: impl Into<String>) -> Self {
        let binding = binding.into();
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }
}

/// Frames delivered to one subscription, in arrival order.
///
/// An `Err` item means the subscription is gone; the stream yields nothing
/// useful after it.
pub type FrameStream = BoxStream<'static, Result<Frame>>;

// ============================================================================
// Trait
// ============================================================================

/// Publish/subscribe capability.
///
/// Implementations:
/// - `ChannelBus`: in-process topic exchange for offline mode and tests
/// - `AmqpBus`: RabbitMQ via AMQP (feature `amqp`)
/// - `MockBus`: records publishes, frames injected by tests
///
/// Implementations serialize concurrent publishes themselves; callers may
/// publish from any task.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one frame to `exchange` under `frame.routing_key`.
    async fn publish(&self, exchange: Exchange, frame: Frame) -> Result<()>;

    /// Start consuming a queue, creating it and its bindings as needed.
    async fn subscribe(&self, subscription: &Subscription) -> Result<FrameStream>;

    /// Add a binding to a queue that is already subscribed.
    async fn bind(&self, queue: &str, exchange: Exchange, binding: &str) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;
}
