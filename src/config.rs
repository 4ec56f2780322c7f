//! Client configuration
//!
//! Loaded from TOML. Every section except `[pool]` is optional and falls back
//! to the documented defaults. Credentials are never stored in the file: the
//! file names the environment variables to read at connect time.

use crate::client::state::ReconnectConfig;
use crate::pool::{BrokerPool, PoolError};
use crate::topics::{validate_client_id, validate_topic_filter};
use crate::transport::DeliveryQos;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    pub pool: PoolSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub subscriptions: SubscriptionsSection,
}

/// Connection behaviour and MQTT session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Base client identifier; a unique suffix is added per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Per-attempt connect timeout (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Delay after a full failed pass over the pool (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub retry_backoff_ms: u64,
    /// Optional escalating delays used before settling on `retry_backoff_ms`
    #[serde(default)]
    pub backoff_pattern_ms: Vec<u64>,
    /// Acknowledgment wait for each publish (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub publish_ack_timeout_ms: u64,
    /// MQTT keep alive in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub qos: DeliveryQos,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            connect_timeout_ms: default_timeout_ms(),
            retry_backoff_ms: default_timeout_ms(),
            backoff_pattern_ms: Vec::new(),
            publish_ack_timeout_ms: default_timeout_ms(),
            keep_alive_secs: default_keep_alive(),
            qos: DeliveryQos::default(),
            username_env: None,
            password_env: None,
        }
    }
}

/// Ordered broker endpoints, tried in this order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// Offline journal location
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Topic filters subscribed on start
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionsSection {
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_client_id() -> String {
    "failover-client".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive() -> u64 {
    60
}

fn default_store_path() -> PathBuf {
    PathBuf::from("message_buffer.jsonl")
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker pool: {0}")]
    InvalidPool(#[from] PoolError),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client.client_id)
            .map_err(|e| ConfigError::InvalidClientId(e.to_string()))?;

        // Parses every URL and rejects an empty pool
        self.broker_pool()?;

        for (name, value) in [
            ("connect_timeout_ms", self.client.connect_timeout_ms),
            ("retry_backoff_ms", self.client.retry_backoff_ms),
            ("publish_ack_timeout_ms", self.client.publish_ack_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for topic in &self.subscriptions.topics {
            validate_topic_filter(topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("subscription '{topic}': {e}"))
            })?;
        }

        Ok(())
    }

    pub fn broker_pool(&self) -> Result<BrokerPool, ConfigError> {
        Ok(BrokerPool::from_urls(&self.pool.brokers)?)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            backoff_pattern: self.client.backoff_pattern_ms.clone(),
            sustained_delay: self.client.retry_backoff_ms,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client.connect_timeout_ms)
    }

    pub fn publish_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.client.publish_ack_timeout_ms)
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.client.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.client.password_env.as_ref())
    }
}
