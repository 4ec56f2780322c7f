//! Failover-aware publish/subscribe client
//!
//! [`FailoverClient`] is the caller-facing façade. It owns:
//!
//! - a supervisor task ([`supervisor`]) that keeps one broker session alive,
//!   rotating through the [`BrokerPool`] when a broker is unreachable or drops
//! - a replay engine ([`replay`]) that drains the offline store in order over
//!   every new session
//! - the [`SubscriptionRegistry`], re-applied after every reconnection
//!
//! Publishes never get lost: when no session is usable they are appended to
//! the [`OfflineStore`] and delivered by the next replay.
//!
//! # Usage
//!
//! ```rust,no_run
//! use failover_mqtt::config::ClientConfig;
//! use failover_mqtt::FailoverClient;
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::load_from_file(Path::new("failover.toml"))?;
//! let client = FailoverClient::from_config(&config).await?;
//! client.on_message(|topic, payload| {
//!     println!("{topic}: {}", String::from_utf8_lossy(payload));
//! }).await;
//! client.start().await?;
//! client.publish("ha/cluster/test", b"hello").await?;
//! client.stop().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod replay;
pub mod state;
pub mod subscriptions;
pub mod supervisor;

pub use replay::ReplayOutcome;
pub use state::{ReconnectConfig, SupervisorState};
pub use subscriptions::SubscriptionRegistry;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::{BrokerPool, Endpoint};
use crate::store::{JournalStore, OfflineStore};
use crate::topics::{validate_publish_topic, validate_topic_filter};
use crate::transport::mqtt::MqttTransportFactory;
use crate::transport::{DeliveryQos, TransportBinding, TransportFactory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use state::{ConnectionEvent, Supervision};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop()` lets an in-flight replay wind down before aborting it
const REPLAY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub type StatusCallback = Arc<dyn Fn(&SupervisorState) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Timing and delivery settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Per-endpoint connect timeout
    pub connect_timeout: Duration,
    /// Acknowledgment wait for each publish and subscribe
    pub publish_ack_timeout: Duration,
    pub qos: DeliveryQos,
    /// Backoff between full failed passes over the pool
    pub reconnect: ReconnectConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            publish_ack_timeout: Duration::from_secs(5),
            qos: DeliveryQos::AtLeastOnce,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            publish_ack_timeout: config.publish_ack_timeout(),
            qos: config.client.qos,
            reconnect: config.reconnect_config(),
        }
    }
}

/// Result of a successful `publish`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// A broker acknowledged the message
    Sent,
    /// The message was durably buffered and will be replayed
    Queued { id: u64 },
}

/// Point-in-time client counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Messages acknowledged on the direct publish path
    pub sent: u64,
    /// Messages appended to the offline store
    pub queued: u64,
    /// Buffered messages acknowledged during replay
    pub replayed: u64,
    /// Sessions re-established after a lost one
    pub failovers: u64,
    pub current_endpoint: Option<Endpoint>,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) sent: AtomicU64,
    pub(crate) queued: AtomicU64,
    pub(crate) replayed: AtomicU64,
    pub(crate) failovers: AtomicU64,
}

/// The live session; at most one exists per client
#[derive(Clone)]
pub(crate) struct ActiveConnection {
    pub(crate) id: u64,
    pub(crate) endpoint: Endpoint,
    pub(crate) binding: Arc<dyn TransportBinding>,
}

/// State shared by the façade, the supervisor task and replay tasks
pub(crate) struct ClientCore {
    pub(crate) pool: Mutex<BrokerPool>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) store: Arc<dyn OfflineStore>,
    pub(crate) options: ClientOptions,
    pub(crate) subscriptions: Mutex<SubscriptionRegistry>,
    pub(crate) counters: Counters,
    /// Set while buffered messages are being replayed; publishes queue behind it
    pub(crate) replaying: AtomicBool,
    pub(crate) replay_lock: Mutex<()>,
    connection: RwLock<Option<ActiveConnection>>,
    state_tx: watch::Sender<SupervisorState>,
    status_callbacks: RwLock<Vec<StatusCallback>>,
    message_callbacks: RwLock<Vec<MessageCallback>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    replay_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_connection_id: AtomicU64,
}

impl ClientCore {
    pub(crate) fn state(&self) -> SupervisorState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a state machine event, log it and notify observers
    pub(crate) async fn transition(&self, event: ConnectionEvent) {
        let current = self.state();
        let next = Supervision::determine_next_state(&current, event);
        if next == current {
            return;
        }

        Supervision::log_state_transition(&current, &next);
        self.state_tx.send_replace(next.clone());

        for callback in self.status_callbacks.read().await.iter() {
            callback(&next);
        }
    }

    pub(crate) async fn current_connection(&self) -> Option<ActiveConnection> {
        self.connection.read().await.clone()
    }

    pub(crate) async fn set_connection(&self, connection: ActiveConnection) {
        *self.connection.write().await = Some(connection);
        *self.connected_since.lock().await = Some(Utc::now());
    }

    pub(crate) async fn take_connection(&self) -> Option<ActiveConnection> {
        *self.connected_since.lock().await = None;
        self.connection.write().await.take()
    }

    pub(crate) async fn dispatch_message(&self, topic: &str, payload: &[u8]) {
        debug!(target: "failover", "Received {} bytes on {}", payload.len(), topic);
        for callback in self.message_callbacks.read().await.iter() {
            callback(topic, payload);
        }
    }

    /// Start a replay run unless one is already in progress
    pub(crate) async fn kick_replay(self: &Arc<Self>) {
        if !self.state().can_publish() || self.replaying.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_replay().await;
    }

    /// Spawn a replay run; the caller has already raised `replaying`
    pub(crate) async fn spawn_replay(self: &Arc<Self>) {
        let core = self.clone();
        let handle = tokio::spawn(async move {
            match replay::run(core).await {
                ReplayOutcome::Completed { replayed } if replayed > 0 => {
                    info!("Replay complete: {} buffered messages delivered", replayed);
                }
                ReplayOutcome::Completed { .. } => {}
                ReplayOutcome::Interrupted { replayed, error } => {
                    warn!(
                        "Replay interrupted after {} messages, rest kept for next connection: {}",
                        replayed, error
                    );
                }
            }
        });

        let mut tasks = self.replay_tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Tear down the session after the supervisor task has exited
    async fn shutdown(&self) {
        if let Some(connection) = self.take_connection().await {
            if let Err(e) = connection.binding.disconnect().await {
                warn!(endpoint = %connection.endpoint, "Disconnect failed: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.replay_tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(REPLAY_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.replaying.store(false, Ordering::SeqCst);

        self.transition(ConnectionEvent::Stopped).await;
    }
}

struct Session {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Failover-aware client with durable offline buffering
pub struct FailoverClient {
    core: Arc<ClientCore>,
    session: Mutex<Option<Session>>,
}

impl FailoverClient {
    pub fn new(
        pool: BrokerPool,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn OfflineStore>,
        options: ClientOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);

        Self {
            core: Arc::new(ClientCore {
                pool: Mutex::new(pool),
                factory,
                store,
                options,
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                counters: Counters::default(),
                replaying: AtomicBool::new(false),
                replay_lock: Mutex::new(()),
                connection: RwLock::new(None),
                state_tx,
                status_callbacks: RwLock::new(Vec::new()),
                message_callbacks: RwLock::new(Vec::new()),
                connected_since: Mutex::new(None),
                replay_tasks: Mutex::new(Vec::new()),
                next_connection_id: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
        }
    }

    /// Build an MQTT client with a journal store and the configured subscriptions
    pub async fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let pool = config.broker_pool()?;
        let store = Arc::new(JournalStore::open(&config.store.path)?);
        let factory = Arc::new(MqttTransportFactory::new(config.client.clone()));

        let client = Self::new(pool, factory, store, ClientOptions::from(config));
        for filter in &config.subscriptions.topics {
            client.subscribe(filter).await?;
        }
        Ok(client)
    }

    /// Spawn the supervisor; returns immediately
    pub async fn start(&self) -> ClientResult<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(ClientError::AlreadyRunning);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor::run(
            self.core.clone(),
            events_tx,
            events_rx,
            shutdown_rx,
        ));

        *session = Some(Session {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the supervisor and close the live session. Idempotent.
    pub async fn stop(&self) -> ClientResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        session.shutdown_tx.send_replace(true);
        if let Err(e) = session.handle.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }

        self.core.shutdown().await;
        Ok(())
    }

    /// Send now if connected, otherwise buffer durably
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> ClientResult<PublishOutcome> {
        validate_publish_topic(topic).map_err(|e| ClientError::invalid_topic(topic, e))?;

        let core = &self.core;
        // Anything still buffered goes out first, even on a healthy session
        let direct = core.state().can_publish()
            && !core.replaying.load(Ordering::SeqCst)
            && core.store.is_empty().await?;
        if direct {
            if let Some(connection) = core.current_connection().await {
                match connection
                    .binding
                    .publish(topic, payload, core.options.qos, core.options.publish_ack_timeout)
                    .await
                {
                    Ok(()) => {
                        core.counters.sent.fetch_add(1, Ordering::Relaxed);
                        return Ok(PublishOutcome::Sent);
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %connection.endpoint,
                            "Publish to {} failed, buffering: {}", topic, e
                        );
                    }
                }
            }
        }

        let id = core.store.append(topic, payload).await?;
        core.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!(target: "failover", "Buffered message {} for {}", id, topic);

        // Covers a replay that finished between our check and the append
        core.kick_replay().await;
        Ok(PublishOutcome::Queued { id })
    }

    /// Register a filter and subscribe now if connected.
    /// Repeating the call re-issues the broker subscribe, retrying one that failed.
    pub async fn subscribe(&self, filter: &str) -> ClientResult<()> {
        validate_topic_filter(filter).map_err(|e| ClientError::invalid_topic(filter, e))?;

        let mut registry = self.core.subscriptions.lock().await;
        if !registry.add(filter) {
            debug!(target: "failover", "{} already registered, re-applying", filter);
        }

        if let Some(connection) = self.connected_session().await {
            if let Err(e) = connection
                .binding
                .subscribe(filter, self.core.options.qos, self.core.options.publish_ack_timeout)
                .await
            {
                warn!(
                    "Subscribe to {} failed, will retry on next connection: {}",
                    filter,
                    ClientError::subscribe_failure(filter, e.to_string())
                );
            }
        }
        Ok(())
    }

    /// Forget a filter and unsubscribe now if connected
    pub async fn unsubscribe(&self, filter: &str) -> ClientResult<()> {
        // Held across the broker call so a re-apply on connect cannot restore it
        let mut registry = self.core.subscriptions.lock().await;
        if !registry.remove(filter) {
            return Ok(());
        }

        if let Some(connection) = self.connected_session().await {
            if let Err(e) = connection
                .binding
                .unsubscribe(filter, self.core.options.publish_ack_timeout)
                .await
            {
                warn!("Unsubscribe from {} failed: {}", filter, e);
            }
        }
        Ok(())
    }

    /// Called on every supervisor state change
    pub async fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&SupervisorState) + Send + Sync + 'static,
    {
        self.core
            .status_callbacks
            .write()
            .await
            .push(Arc::new(callback));
    }

    /// Called for every inbound message on the live session
    pub async fn on_message<F>(&self, callback: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.core
            .message_callbacks
            .write()
            .await
            .push(Arc::new(callback));
    }

    pub fn state(&self) -> SupervisorState {
        self.core.state()
    }

    /// Watch receiver for state changes
    pub fn status(&self) -> watch::Receiver<SupervisorState> {
        self.core.state_tx.subscribe()
    }

    pub async fn stats(&self) -> ClientStats {
        let counters = &self.core.counters;
        let state = self.core.state();
        ClientStats {
            sent: counters.sent.load(Ordering::Relaxed),
            queued: counters.queued.load(Ordering::Relaxed),
            replayed: counters.replayed.load(Ordering::Relaxed),
            failovers: counters.failovers.load(Ordering::Relaxed),
            current_endpoint: match state {
                SupervisorState::Connected(endpoint) => Some(endpoint),
                _ => None,
            },
            connected_since: *self.core.connected_since.lock().await,
        }
    }

    /// True while buffered messages are being replayed; publishes queue meanwhile
    pub fn is_replaying(&self) -> bool {
        self.core.replaying.load(Ordering::SeqCst)
    }

    /// Number of buffered messages waiting for replay
    pub async fn pending_messages(&self) -> ClientResult<usize> {
        Ok(self.core.store.len().await?)
    }

    /// Registered subscription filters in registration order
    pub async fn subscriptions(&self) -> Vec<String> {
        self.core.subscriptions.lock().await.filters().to_vec()
    }

    async fn connected_session(&self) -> Option<ActiveConnection> {
        self.core
            .current_connection()
            .await
            .filter(|connection| connection.binding.is_connected())
    }
}
