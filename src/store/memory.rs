//! In-process offline store
//!
//! Same ordering and id semantics as the journal, without persistence.
//! Useful for short-lived clients and tests.

use super::{BufferedMessage, OfflineStore, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<u64, BufferedMessage>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.insert(
            id,
            BufferedMessage {
                id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                enqueued_at: chrono::Utc::now(),
            },
        );
        Ok(id)
    }

    async fn drain_ordered(&self) -> Result<Vec<BufferedMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.values().cloned().collect())
    }

    async fn remove(&self, id: u64) -> Result<(), StoreError> {
        self.inner.lock().await.messages.remove(&id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.messages.len())
    }
}
