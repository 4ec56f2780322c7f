//! MQTT v5 transport binding over rumqttc
//!
//! Pure functions are kept apart from I/O for testability:
//!
//! - [`connection`] - Option building, QoS mapping and link state
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`ack_tracker`] - Matching acknowledgments to the request in flight
//! - [`client`] - The binding itself and its event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use failover_mqtt::config::ClientSection;
//! use failover_mqtt::pool::Endpoint;
//! use failover_mqtt::transport::mqtt::MqttTransportFactory;
//! use failover_mqtt::transport::{DeliveryQos, TransportFactory};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let factory = MqttTransportFactory::new(ClientSection::default());
//! let binding = factory.create(&Endpoint::new("localhost", 1883), 1, events)?;
//! binding.connect(Duration::from_secs(5)).await?;
//! binding
//!     .publish("ha/cluster/test", b"hello", DeliveryQos::AtLeastOnce, Duration::from_secs(5))
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttBinding, MqttTransportFactory};
pub use connection::{configure_mqtt_options, LinkState};
pub use message_handler::{EventRoute, MessageHandler, RequestKind};
