//! Transport layer for broker connections
//!
//! The failover logic never talks to a network library directly. It asks a
//! [`TransportFactory`] for one [`TransportBinding`] per connection attempt and
//! listens to the [`TransportEvent`]s that binding emits. Every event carries
//! the connection id it was created with so events from a superseded
//! connection can be told apart and ignored.

use crate::pool::Endpoint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Delivery guarantee requested for publishes and subscriptions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryQos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Events emitted by a binding over its lifetime
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the session
    Connected { connection_id: u64 },
    /// The session ended; emitted at most once, and only after `Connected`
    Disconnected { connection_id: u64, reason: String },
    /// Inbound application message
    Message {
        connection_id: u64,
        topic: String,
        payload: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            TransportEvent::Connected { connection_id }
            | TransportEvent::Disconnected { connection_id, .. }
            | TransportEvent::Message { connection_id, .. } => *connection_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No ConnAck from {endpoint} within {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: Endpoint, reason: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("No acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("Broker rejected request: {0}")]
    Rejected(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

/// One live (or attempted) broker session
///
/// All methods take `&self`; bindings are shared between the supervisor,
/// the replay task and publishers.
#[async_trait::async_trait]
pub trait TransportBinding: Send + Sync {
    /// Open the session and wait until the broker accepts it
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Publish and wait for the acknowledgment matching `qos`
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Subscribe and wait for the broker's acknowledgment
    async fn subscribe(
        &self,
        filter: &str,
        qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str, ack_timeout: Duration)
        -> Result<(), TransportError>;

    /// Close the session. Emits no `Disconnected` event.
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn endpoint(&self) -> &Endpoint;
}

/// Creates one binding per connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &Endpoint,
        connection_id: u64,
        events: EventSender,
    ) -> Result<Arc<dyn TransportBinding>, TransportError>;
}
