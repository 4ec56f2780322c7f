//! Replay of buffered messages over the live session
//!
//! A run snapshots the store and publishes each record oldest first, waiting
//! for the broker's acknowledgment before deleting it. The first failure ends
//! the run and leaves the rest in place. When a snapshot drains cleanly the
//! store is checked again, since publishes made during the run were queued
//! behind it.

use super::ClientCore;
use crate::error::{ClientError, ClientResult};
use crate::replay_span;
use crate::transport::TransportError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, Instrument};

/// How a replay run ended
#[derive(Debug)]
pub enum ReplayOutcome {
    /// The store was empty when the run finished
    Completed { replayed: usize },
    /// A publish or store operation failed; remaining records stay buffered
    Interrupted { replayed: usize, error: ClientError },
}

impl ReplayOutcome {
    pub fn replayed(&self) -> usize {
        match self {
            ReplayOutcome::Completed { replayed } | ReplayOutcome::Interrupted { replayed, .. } => {
                *replayed
            }
        }
    }
}

/// Replay until the store is empty or something fails.
/// Runs are serialized; the caller has already raised `core.replaying`.
pub(crate) async fn run(core: Arc<ClientCore>) -> ReplayOutcome {
    let _running = core.replay_lock.lock().await;

    let pending = core.store.len().await.unwrap_or_default();
    let mut replayed = 0usize;
    let mut connection_id = None;

    async {
        loop {
            if let Err(error) = drain_snapshots(&core, &mut replayed, &mut connection_id).await {
                // Only the run for the live session owns the flag
                let live_id = core.current_connection().await.map(|c| c.id);
                if live_id.is_none() || connection_id.is_none() || live_id == connection_id {
                    core.replaying.store(false, Ordering::SeqCst);
                }
                return ReplayOutcome::Interrupted { replayed, error };
            }

            core.replaying.store(false, Ordering::SeqCst);

            // A publish may have queued between the last snapshot and the flag reset
            match core.store.is_empty().await {
                Ok(true) => return ReplayOutcome::Completed { replayed },
                Ok(false)
                    if core.state().can_publish()
                        && !core.replaying.swap(true, Ordering::SeqCst) =>
                {
                    continue
                }
                Ok(false) => return ReplayOutcome::Completed { replayed },
                Err(e) => {
                    return ReplayOutcome::Interrupted {
                        replayed,
                        error: e.into(),
                    }
                }
            }
        }
    }
    .instrument(replay_span!(pending = pending))
    .await
}

async fn drain_snapshots(
    core: &ClientCore,
    replayed: &mut usize,
    connection_id: &mut Option<u64>,
) -> ClientResult<()> {
    loop {
        let snapshot = core.store.drain_ordered().await?;
        if snapshot.is_empty() {
            return Ok(());
        }

        let connection = core
            .current_connection()
            .await
            .ok_or(ClientError::PublishFailure(TransportError::NotConnected))?;
        *connection_id = Some(connection.id);

        debug!(
            target: "failover",
            endpoint = %connection.endpoint,
            "Replaying {} buffered messages",
            snapshot.len()
        );

        for message in snapshot {
            connection
                .binding
                .publish(
                    &message.topic,
                    &message.payload,
                    core.options.qos,
                    core.options.publish_ack_timeout,
                )
                .await
                .map_err(ClientError::PublishFailure)?;

            // Acked but not removed: replayed again next time (at-least-once)
            core.store.remove(message.id).await?;
            core.counters.replayed.fetch_add(1, Ordering::Relaxed);
            *replayed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_replayed_count() {
        assert_eq!(ReplayOutcome::Completed { replayed: 3 }.replayed(), 3);
        let interrupted = ReplayOutcome::Interrupted {
            replayed: 1,
            error: ClientError::PublishFailure(TransportError::NotConnected),
        };
        assert_eq!(interrupted.replayed(), 1);
    }
}
