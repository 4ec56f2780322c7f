//! Connection supervisor task
//!
//! One task per client session. It owns the connect loop: try endpoints in
//! pool order, back off after a full failed pass, and on success re-apply
//! subscriptions, start a replay and wait for the session to end. A lost
//! session always fails over to the next endpoint first.

use super::state::{ConnectionEvent, ReconnectionDecision, Supervision};
use super::{ActiveConnection, ClientCore};
use crate::error::{ClientError, ClientResult};
use crate::pool::Endpoint;
use crate::supervisor_span;
use crate::transport::{EventReceiver, EventSender, TransportEvent};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// How a live session ended
enum SessionEnd {
    Lost(String),
    Shutdown,
}

/// Supervisor main loop; returns once shutdown is signalled
pub(crate) async fn run(
    core: Arc<ClientCore>,
    events_tx: EventSender,
    mut events: EventReceiver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = supervisor_span!(pool_size = core.pool.lock().await.len());
    async move {
        info!("Supervisor started");
        let mut failover = false;
        let mut had_session = false;

        loop {
            let Some(connection) =
                connect_with_failover(&core, &events_tx, &mut shutdown_rx, failover).await
            else {
                break;
            };

            if had_session {
                core.counters.failovers.fetch_add(1, Ordering::Relaxed);
            }
            had_session = true;

            match on_connected(&core, &connection, &mut shutdown_rx).await {
                Ok(true) => {}
                // The session is torn down by the client's shutdown
                Ok(false) => break,
                Err(e) => {
                    warn!(endpoint = %connection.endpoint, "Session demoted: {}", e);
                    drop_session(&core, &connection, e.to_string()).await;
                    failover = true;
                    continue;
                }
            }

            match wait_for_session_end(&core, &mut events, &mut shutdown_rx, connection.id).await {
                SessionEnd::Lost(reason) => {
                    drop_session(&core, &connection, reason).await;
                    failover = true;
                }
                SessionEnd::Shutdown => break,
            }
        }

        info!("Supervisor stopped");
    }
    .instrument(span)
    .await
}

/// Try endpoints until one accepts a session. `None` means shutdown.
///
/// With `failover` set the pool advances before the first attempt so a
/// broker that just dropped us is tried last.
async fn connect_with_failover(
    core: &Arc<ClientCore>,
    events_tx: &EventSender,
    shutdown_rx: &mut watch::Receiver<bool>,
    failover: bool,
) -> Option<ActiveConnection> {
    let (mut endpoint, pool_size) = {
        let mut pool = core.pool.lock().await;
        let endpoint = if failover {
            pool.advance().clone()
        } else {
            pool.current().clone()
        };
        (endpoint, pool.len())
    };
    core.transition(ConnectionEvent::AttemptStarted(endpoint.clone()))
        .await;

    let mut failed_passes = 0u32;
    loop {
        for attempt in 1..=pool_size {
            if *shutdown_rx.borrow() {
                return None;
            }

            match attempt_connect(core, &endpoint, events_tx, shutdown_rx).await {
                Ok(Some(connection)) => {
                    let mut pool = core.pool.lock().await;
                    if let Some(index) = pool.position(&endpoint) {
                        pool.select(index);
                    }
                    return Some(connection);
                }
                Ok(None) => return None,
                Err(e) => {
                    debug!(target: "failover", "Attempt {} of pass failed: {}", attempt, e);
                    endpoint = core.pool.lock().await.advance().clone();
                    if attempt < pool_size {
                        core.transition(ConnectionEvent::AttemptFailed {
                            next: endpoint.clone(),
                        })
                        .await;
                    }
                }
            }
        }

        // A full pass advanced the cursor back to where it started
        failed_passes = failed_passes.saturating_add(1);
        let delay_ms = match Supervision::should_retry_pass(
            failed_passes,
            &core.options.reconnect,
            *shutdown_rx.borrow(),
        ) {
            ReconnectionDecision::Proceed { delay_ms, .. } => delay_ms,
            ReconnectionDecision::AbortShutdownRequested => return None,
        };

        core.transition(ConnectionEvent::PassExhausted {
            passes: failed_passes,
            retry_in: Duration::from_millis(delay_ms),
        })
        .await;

        if !interruptible_sleep(shutdown_rx, delay_ms).await {
            return None;
        }

        endpoint = core.pool.lock().await.current().clone();
        core.transition(ConnectionEvent::AttemptStarted(endpoint.clone()))
            .await;
    }
}

/// One connection attempt. `Ok(None)` means shutdown interrupted it.
async fn attempt_connect(
    core: &Arc<ClientCore>,
    endpoint: &Endpoint,
    events_tx: &EventSender,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ClientResult<Option<ActiveConnection>> {
    let connection_id = core.next_connection_id();
    let binding = core
        .factory
        .create(endpoint, connection_id, events_tx.clone())
        .map_err(|e| ClientError::connect_failure(e.to_string()))?;

    let timeout = core.options.connect_timeout;
    let result = tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                let _ = binding.disconnect().await;
                return Ok(None);
            }
            Err(ClientError::connect_failure("attempt interrupted"))
        }
        result = tokio::time::timeout(timeout, binding.connect(timeout)) => match result {
            Ok(Ok(())) if binding.is_connected() => Ok(()),
            Ok(Ok(())) => Err(ClientError::connect_failure(format!(
                "{endpoint} reported success but is not connected"
            ))),
            Ok(Err(e)) => Err(ClientError::connect_failure(e.to_string())),
            Err(_) => Err(ClientError::connect_failure(format!(
                "no ConnAck from {endpoint} within {timeout:?}"
            ))),
        },
    };

    match result {
        Ok(()) => Ok(Some(ActiveConnection {
            id: connection_id,
            endpoint: endpoint.clone(),
            binding,
        })),
        Err(e) => {
            let _ = binding.disconnect().await;
            Err(e)
        }
    }
}

/// Publish the session, re-apply subscriptions and start replay.
/// Returns false if shutdown was signalled first.
async fn on_connected(
    core: &Arc<ClientCore>,
    connection: &ActiveConnection,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ClientResult<bool> {
    // Publishes queue behind the replay from the moment the session is visible
    core.replaying.store(true, Ordering::SeqCst);
    core.set_connection(connection.clone()).await;
    core.transition(ConnectionEvent::ConnectSucceeded).await;

    {
        // Held throughout so subscribe/unsubscribe calls land after the re-apply
        let registry = core.subscriptions.lock().await;
        for filter in registry.filters() {
            let subscribe = connection.binding.subscribe(
                filter,
                core.options.qos,
                core.options.publish_ack_timeout,
            );
            let Some(result) = unless_shutdown(shutdown_rx, subscribe).await else {
                info!("Shutdown signal received while re-subscribing, stopping");
                return Ok(false);
            };
            result.map_err(|e| ClientError::subscribe_failure(filter.as_str(), e.to_string()))?;
            debug!(target: "failover", "Re-subscribed to {}", filter);
        }
        if !registry.is_empty() {
            info!(endpoint = %connection.endpoint, "Re-applied {} subscriptions", registry.len());
        }
    }

    core.spawn_replay().await;
    Ok(true)
}

/// Drive `operation` to completion unless shutdown is signalled first
async fn unless_shutdown<F: Future>(
    shutdown_rx: &mut watch::Receiver<bool>,
    operation: F,
) -> Option<F::Output> {
    tokio::pin!(operation);

    loop {
        if *shutdown_rx.borrow() {
            return None;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            output = &mut operation => return Some(output),
        }
    }
}

/// Forget a session that ended or was demoted
async fn drop_session(core: &Arc<ClientCore>, connection: &ActiveConnection, reason: String) {
    if let Some(current) = core.take_connection().await {
        if current.id != connection.id {
            warn!("Dropped session {} was not the live one", connection.id);
        }
    }
    if let Err(e) = connection.binding.disconnect().await {
        debug!(target: "failover", "Disconnect after loss failed: {}", e);
    }
    // Nothing left to replay over; a stale replay fails on its own
    core.replaying.store(false, Ordering::SeqCst);
    core.transition(ConnectionEvent::ConnectionLost(reason)).await;
}

/// Dispatch inbound messages until the live session ends
async fn wait_for_session_end(
    core: &Arc<ClientCore>,
    events: &mut EventReceiver,
    shutdown_rx: &mut watch::Receiver<bool>,
    connection_id: u64,
) -> SessionEnd {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return SessionEnd::Lost("Event channel closed".to_string());
                };
                if event.connection_id() != connection_id {
                    debug!(
                        target: "failover",
                        "Ignoring event from stale connection {}",
                        event.connection_id()
                    );
                    continue;
                }
                match event {
                    TransportEvent::Message { topic, payload, .. } => {
                        core.dispatch_message(&topic, &payload).await;
                    }
                    TransportEvent::Disconnected { reason, .. } => {
                        return SessionEnd::Lost(reason);
                    }
                    TransportEvent::Connected { .. } => {}
                }
            }
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during backoff, stopping");
                    return false;
                }
            }
            _ = &mut sleep => return true,
        }
    }
}
