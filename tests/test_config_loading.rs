//! Configuration loading and validation tests
//!
//! Tests focus on behaviour of loading from disk and what the loaded
//! configuration produces, not on TOML parsing details.

use failover_mqtt::config::{ClientConfig, ConfigError};
use failover_mqtt::{ClientOptions, DeliveryQos, Endpoint, FailoverClient, PublishOutcome};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[client]
client_id = "ops-console"
connect_timeout_ms = 2000
retry_backoff_ms = 3000
backoff_pattern_ms = [250, 1000]
qos = "exactly_once"

[pool]
brokers = ["mqtt://b1.example.com:1883", "tcp://b2.example.com"]

[store]
path = "/var/lib/failover/buffer.jsonl"

[subscriptions]
topics = ["ha/cluster/#", "alerts/+/critical"]
"#
    )
    .unwrap();

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.client.client_id, "ops-console");
    assert_eq!(config.client.qos, DeliveryQos::ExactlyOnce);
    assert_eq!(config.store.path, Path::new("/var/lib/failover/buffer.jsonl"));
    assert_eq!(config.subscriptions.topics.len(), 2);

    let pool = config.broker_pool().unwrap();
    assert_eq!(
        pool.endpoints(),
        &[
            Endpoint::new("b1.example.com", 1883),
            Endpoint::new("b2.example.com", 1883)
        ]
    );

    let options = ClientOptions::from(&config);
    assert_eq!(options.connect_timeout, Duration::from_millis(2000));
    assert_eq!(options.publish_ack_timeout, Duration::from_millis(5000));
    assert_eq!(options.reconnect.backoff_pattern, vec![250, 1000]);
    assert_eq!(options.reconnect.sustained_delay, 3000);
}

#[test]
fn test_missing_file_is_reported() {
    let result = ClientConfig::load_from_file(Path::new("/nonexistent/failover.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_reported() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[pool\nbrokers = ").unwrap();

    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_broker_scheme_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[pool]
brokers = ["http://localhost:1883"]
"#
    )
    .unwrap();

    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidPool(_))));
}

#[test]
fn test_shown_config_round_trips() {
    let config = ClientConfig::from_toml_str(
        r#"
[pool]
brokers = ["mqtt://localhost:1883"]
"#,
    )
    .unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = ClientConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

#[tokio::test]
async fn test_client_from_config_buffers_into_configured_journal() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("buffer.jsonl");
    let toml = format!(
        r#"
[pool]
brokers = ["mqtt://127.0.0.1:1"]

[store]
path = "{}"

[subscriptions]
topics = ["ha/#"]
"#,
        journal.display()
    );
    let config = ClientConfig::from_toml_str(&toml).unwrap();

    let client = FailoverClient::from_config(&config).await.unwrap();
    assert_eq!(client.subscriptions().await, vec!["ha/#"]);

    let outcome = client.publish("ha/cluster/test", b"offline").await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Queued { .. }));
    assert_eq!(client.pending_messages().await.unwrap(), 1);
    assert!(journal.exists());
}
