//! Failover MQTT - Rust Implementation
//!
//! A publish/subscribe client that keeps talking to a pool of MQTT brokers
//! and never loses a message while none of them is reachable.
//!
//! # Overview
//!
//! - Ordered broker pool with round-robin failover
//! - Connection supervisor with bounded connect attempts and pass backoff
//! - Durable offline store for publishes made while disconnected
//! - In-order replay of buffered messages on every new session
//! - Subscriptions re-applied automatically after each reconnection
//!
//! # Quick Start
//!
//! ```rust
//! use failover_mqtt::testing::{MockNetwork, MockTransportFactory};
//! use failover_mqtt::{BrokerPool, ClientOptions, FailoverClient, MemoryStore, PublishOutcome};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let pool = BrokerPool::from_urls(&["mqtt://localhost:1883", "mqtt://localhost:1884"])?;
//! let factory = Arc::new(MockTransportFactory::new(MockNetwork::new()));
//! let client = FailoverClient::new(pool, factory, Arc::new(MemoryStore::new()), ClientOptions::default());
//!
//! // Not started yet: the message is buffered for replay
//! let outcome = client.publish("ha/cluster/test", b"hello").await?;
//! assert!(matches!(outcome, PublishOutcome::Queued { .. }));
//! assert_eq!(client.pending_messages().await?, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod pool;
pub mod store;
pub mod testing;
pub mod topics;
pub mod transport;

pub use client::{ClientOptions, ClientStats, FailoverClient, PublishOutcome, SupervisorState};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use pool::{BrokerPool, Endpoint};
pub use store::{JournalStore, MemoryStore, OfflineStore};
pub use transport::DeliveryQos;
