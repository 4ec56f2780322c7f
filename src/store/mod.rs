//! Durable offline buffering for messages that could not be delivered
//!
//! The [`OfflineStore`] contract is deliberately small: append, ordered
//! non-destructive drain, and idempotent delete-by-id. Any ordered,
//! crash-safe medium can back it.
//!
//! - [`journal`] - append-only JSON-lines journal on disk
//! - [`memory`] - in-process store with the same semantics

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod journal;
pub mod memory;

pub use journal::JournalStore;
pub use memory::MemoryStore;

/// A message waiting for replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Monotonic surrogate key, never reused
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Offline store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store record could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable buffer shared by the publish path (writer) and the replay engine
/// (drainer). Implementations serialize all operations behind one lock.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Persist a message and return its id
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<u64, StoreError>;

    /// All undelivered messages, oldest first. Does not delete anything.
    async fn drain_ordered(&self) -> Result<Vec<BufferedMessage>, StoreError>;

    /// Delete one message. Removing an unknown id is not an error.
    async fn remove(&self, id: u64) -> Result<(), StoreError>;

    /// Number of undelivered messages
    async fn len(&self) -> Result<usize, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
