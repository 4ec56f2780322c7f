//! Append-only journal store
//!
//! Every mutation is one JSON line, flushed and `fsync`ed before the call
//! returns. File I/O runs on the blocking pool while the journal lock is held.
//! Opening the journal replays it to rebuild the live set, skipping a torn
//! trailing line left by a crash mid-write, then compacts it. The journal is
//! compacted again whenever the live set drains to empty; a `watermark` record
//! carries the next id across compactions so ids stay monotonic.

use super::{BufferedMessage, OfflineStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Append { message: BufferedMessage },
    Remove { id: u64 },
    Watermark { next_id: u64 },
}

struct Journal {
    path: PathBuf,
    file: File,
    messages: BTreeMap<u64, BufferedMessage>,
    next_id: u64,
    /// A failed write left bytes that could not be cut off
    needs_compaction: bool,
}

impl Journal {
    fn write_record(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        if self.needs_compaction {
            self.compact()?;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let len_before = self.file.metadata()?.len();

        if let Err(e) = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data())
        {
            self.discard_tail(len_before);
            return Err(e.into());
        }
        Ok(())
    }

    /// Cut a partially written record so the next one starts on its own line
    fn discard_tail(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len).and_then(|()| self.file.sync_data()) {
            warn!(
                "Could not truncate journal {} after a failed write: {}",
                self.path.display(),
                e
            );
            self.needs_compaction = true;
        }
    }

    /// Rewrite the journal with only the live records
    fn compact(&mut self) -> Result<(), StoreError> {
        let tmp_path = compaction_path(&self.path);
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            let mut write_line = |record: &JournalRecord| -> Result<(), StoreError> {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
                Ok(())
            };
            write_line(&JournalRecord::Watermark {
                next_id: self.next_id,
            })?;
            for message in self.messages.values() {
                write_line(&JournalRecord::Append {
                    message: message.clone(),
                })?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = open_for_append(&self.path)?;
        self.needs_compaction = false;

        debug!(
            target: "failover",
            "Compacted journal {} ({} live records)",
            self.path.display(),
            self.messages.len()
        );
        Ok(())
    }

    fn append(&mut self, topic: String, payload: Vec<u8>) -> Result<u64, StoreError> {
        let message = BufferedMessage {
            id: self.next_id,
            topic,
            payload,
            enqueued_at: chrono::Utc::now(),
        };
        self.write_record(&JournalRecord::Append {
            message: message.clone(),
        })?;

        let id = message.id;
        self.next_id += 1;
        self.messages.insert(id, message);
        Ok(id)
    }

    fn remove(&mut self, id: u64) -> Result<(), StoreError> {
        if !self.messages.contains_key(&id) {
            return Ok(());
        }

        self.write_record(&JournalRecord::Remove { id })?;
        self.messages.remove(&id);

        if self.messages.is_empty() {
            self.compact()?;
        }
        Ok(())
    }
}

/// File-backed [`OfflineStore`] that survives process restarts
pub struct JournalStore {
    journal: Arc<Mutex<Journal>>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and recover its live records
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (messages, next_id) = if path.exists() {
            recover(&path)?
        } else {
            (BTreeMap::new(), 1)
        };

        let mut journal = Journal {
            file: open_for_append(&path)?,
            path,
            messages,
            next_id,
            needs_compaction: false,
        };
        journal.compact()?;

        info!(
            "Offline journal {} opened with {} buffered messages",
            journal.path.display(),
            journal.messages.len()
        );

        Ok(Self {
            journal: Arc::new(Mutex::new(journal)),
        })
    }

    pub async fn path(&self) -> PathBuf {
        self.journal.lock().await.path.clone()
    }

    /// Run a blocking journal operation on the blocking pool under the lock
    async fn with_journal<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Journal) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let mut journal = self.journal.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || op(&mut *journal))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Journal task failed: {e}")))?
    }
}

#[async_trait]
impl OfflineStore for JournalStore {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<u64, StoreError> {
        let topic = topic.to_string();
        let payload = payload.to_vec();
        self.with_journal(move |journal| journal.append(topic, payload))
            .await
    }

    async fn drain_ordered(&self) -> Result<Vec<BufferedMessage>, StoreError> {
        let journal = self.journal.lock().await;
        Ok(journal.messages.values().cloned().collect())
    }

    async fn remove(&self, id: u64) -> Result<(), StoreError> {
        self.with_journal(move |journal| journal.remove(id)).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.journal.lock().await.messages.len())
    }
}

fn open_for_append(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn compaction_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".compact");
    PathBuf::from(tmp)
}

/// Replay the journal into the live set and the next free id
fn recover(path: &Path) -> Result<(BTreeMap<u64, BufferedMessage>, u64), StoreError> {
    let reader = BufReader::new(File::open(path)?);
    let mut messages = BTreeMap::new();
    let mut next_id = 1u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JournalRecord>(&line) {
            Ok(JournalRecord::Append { message }) => {
                next_id = next_id.max(message.id + 1);
                messages.insert(message.id, message);
            }
            Ok(JournalRecord::Remove { id }) => {
                messages.remove(&id);
            }
            Ok(JournalRecord::Watermark { next_id: mark }) => {
                next_id = next_id.max(mark);
            }
            Err(e) => {
                warn!(
                    "Skipping unreadable journal line {} in {}: {}",
                    line_no + 1,
                    path.display(),
                    e
                );
            }
        }
    }

    Ok((messages, next_id))
}
