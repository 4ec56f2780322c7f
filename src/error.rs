//! Caller-facing error types
//!
//! Lower layers keep their own error enums (`TransportError`, `StoreError`,
//! `ConfigError`). This module maps them onto the small set of failures a
//! caller of [`crate::FailoverClient`] has to handle.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::topics::TopicError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// No broker in the pool accepted a connection
    #[error("Connect failed: {message}")]
    ConnectFailure { message: String },

    /// A broker rejected or never acknowledged a publish
    #[error("Publish failed: {0}")]
    PublishFailure(#[source] TransportError),

    /// The offline store could not persist or read a message
    #[error("Offline store failed: {0}")]
    StorageFailure(#[from] StoreError),

    #[error("Subscribe failed for '{topic}': {message}")]
    SubscribeFailure { topic: String, message: String },

    #[error("Invalid topic '{topic}': {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },

    #[error("Client is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    pub fn connect_failure<S: Into<String>>(message: S) -> Self {
        Self::ConnectFailure {
            message: message.into(),
        }
    }

    pub fn subscribe_failure<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::SubscribeFailure {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn invalid_topic<T: Into<String>>(topic: T, source: TopicError) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            source,
        }
    }

    /// Whether retrying later may succeed without caller changes
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectFailure { .. }
                | ClientError::PublishFailure(_)
                | ClientError::SubscribeFailure { .. }
        )
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_connect_failure_constructor() {
        let error = ClientError::connect_failure("all brokers down");
        assert!(matches!(error, ClientError::ConnectFailure { .. }));
        assert_eq!(error.to_string(), "Connect failed: all brokers down");
        assert!(error.is_transient());
    }

    #[test]
    fn test_subscribe_failure_constructor() {
        let error = ClientError::subscribe_failure("ha/#", "not authorized");
        assert_eq!(
            error.to_string(),
            "Subscribe failed for 'ha/#': not authorized"
        );
    }

    #[test]
    fn test_invalid_topic_is_not_transient() {
        let error = ClientError::invalid_topic("a/+", TopicError::WildcardInTopic('+'));
        assert!(!error.is_transient());
        assert!(error.to_string().contains("a/+"));
    }

    #[test]
    fn test_store_error_converts() {
        let store_error = StoreError::Unavailable("disk full".to_string());
        let error: ClientError = store_error.into();
        assert!(matches!(error, ClientError::StorageFailure(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn test_publish_failure_display() {
        let error = ClientError::PublishFailure(TransportError::AckTimeout(Duration::from_secs(5)));
        assert!(error.to_string().starts_with("Publish failed"));
    }

    #[test]
    fn test_already_running_display() {
        assert_eq!(
            ClientError::AlreadyRunning.to_string(),
            "Client is already running"
        );
    }
}
