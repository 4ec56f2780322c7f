//! Pure connection configuration for the MQTT binding
//!
//! This module contains pure functions for building `MqttOptions` and the
//! link state shared between a binding and its event loop task.

use crate::config::ClientSection;
use crate::pool::Endpoint;
use crate::transport::DeliveryQos;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use std::time::Duration;
use uuid::Uuid;

/// Largest packet accepted or sent, in bytes
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// State of a single binding's broker session
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Session requested, waiting for ConnAck
    Connecting,
    /// ConnAck received
    Connected,
    /// Session over; bindings are never reused after this
    Closed(String),
}

/// Unique client id for each connection attempt to prevent broker conflicts
pub fn unique_client_id(base: &str) -> String {
    format!("{base}-{}", Uuid::new_v4().simple())
}

/// Build `MqttOptions` for one connection attempt
///
/// Credentials are read from the configured environment variables here, at
/// connect time, so rotated secrets are picked up on the next failover.
pub fn configure_mqtt_options(endpoint: &Endpoint, settings: &ClientSection) -> MqttOptions {
    let client_id = unique_client_id(&settings.client_id);
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if let Some(username_env) = &settings.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = settings
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_clean_start(true);
    mqtt_options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

pub fn to_mqtt_qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryQos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique_per_attempt() {
        let a = unique_client_id("ha-publisher");
        let b = unique_client_id("ha-publisher");
        assert!(a.starts_with("ha-publisher-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let endpoint = Endpoint::new("broker.local", 1884);
        let settings = ClientSection {
            keep_alive_secs: 30,
            ..ClientSection::default()
        };

        let options = configure_mqtt_options(&endpoint, &settings);
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.client_id().starts_with("failover-client-"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(DeliveryQos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(DeliveryQos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(DeliveryQos::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn test_link_state_equality() {
        assert_eq!(LinkState::Connected, LinkState::Connected);
        assert_ne!(
            LinkState::Connected,
            LinkState::Closed("test".to_string())
        );
    }
}
