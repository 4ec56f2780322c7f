//! Impure I/O for the MQTT binding
//!
//! Each [`MqttBinding`] owns one rumqttc `AsyncClient`/`EventLoop` pair for a
//! single connection attempt. The event loop is polled in its own task; it
//! never reconnects. The first error ends the session, and the supervisor
//! decides what to do next.

use super::ack_tracker::{AckFailure, AckResult, AckTracker};
use super::connection::{configure_mqtt_options, to_mqtt_qos, LinkState, REQUEST_CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler, RequestKind};
use crate::config::ClientSection;
use crate::pool::Endpoint;
use crate::transport::{
    DeliveryQos, EventSender, TransportBinding, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `disconnect` waits for the event loop to flush DISCONNECT
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between a binding and its event loop task
struct Shared {
    connection_id: u64,
    endpoint: Endpoint,
    state_tx: watch::Sender<LinkState>,
    acks: Mutex<AckTracker>,
    events: EventSender,
    /// Set by `disconnect`; a closing session reports no `Disconnected` event
    closing: AtomicBool,
}

/// One MQTT v5 session against one endpoint
pub struct MqttBinding {
    shared: Arc<Shared>,
    settings: ClientSection,
    client: Mutex<Option<AsyncClient>>,
    state_rx: watch::Receiver<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes publish/subscribe/unsubscribe so one ack is pending at a time
    request_lock: Mutex<()>,
}

impl MqttBinding {
    pub fn new(
        endpoint: Endpoint,
        connection_id: u64,
        settings: ClientSection,
        events: EventSender,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                connection_id,
                endpoint,
                state_tx,
                acks: Mutex::new(AckTracker::new()),
                events,
                closing: AtomicBool::new(false),
            }),
            settings,
            client: Mutex::new(None),
            state_rx,
            shutdown_tx,
            event_loop_handle: Mutex::new(None),
            request_lock: Mutex::new(()),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id
    }

    pub fn link_state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Closed(reason) => {
                        return Err(TransportError::ConnectionFailed {
                            endpoint: endpoint.clone(),
                            reason: reason.clone(),
                        });
                    }
                    LinkState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed {
                        endpoint: endpoint.clone(),
                        reason: "State channel closed".to_string(),
                    });
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout {
                endpoint: endpoint.clone(),
                timeout,
            }),
        }
    }

    /// Poll the event loop until the session ends or shutdown is signalled
    async fn run_event_loop(
        shared: Arc<Shared>,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(
            target: "failover",
            "Event loop started for connection {} to {}",
            shared.connection_id,
            shared.endpoint
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        Self::close(&shared, "Binding shut down").await;
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(&shared, route).await {
                                break;
                            }
                        }
                        Err(e) => {
                            Self::close(&shared, &e.to_string()).await;
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            target: "failover",
            "Event loop stopped for connection {}",
            shared.connection_id
        );
    }

    /// Returns true to continue polling, false once the session is over
    async fn process_event_route(shared: &Shared, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                shared.state_tx.send_replace(LinkState::Connected);
                let _ = shared.events.send(TransportEvent::Connected {
                    connection_id: shared.connection_id,
                });
                true
            }
            EventRoute::ConnectionRefused(reason) => {
                Self::close(shared, &format!("Connection refused: {reason}")).await;
                false
            }
            EventRoute::MessageReceived { topic, payload } => {
                let _ = shared.events.send(TransportEvent::Message {
                    connection_id: shared.connection_id,
                    topic,
                    payload,
                });
                true
            }
            EventRoute::RequestSent { kind, pkid } => {
                shared.acks.lock().await.on_sent(kind, pkid);
                true
            }
            EventRoute::RequestAcknowledged { kind, pkid } => {
                shared.acks.lock().await.on_ack(kind, pkid);
                true
            }
            EventRoute::RequestRejected { kind, pkid, reason } => {
                warn!(
                    endpoint = %shared.endpoint,
                    "Broker rejected {:?} packet {}: {}", kind, pkid, reason
                );
                shared.acks.lock().await.on_reject(kind, pkid, &reason);
                true
            }
            EventRoute::Disconnected(reason) => {
                Self::close(shared, &format!("Broker disconnected: {reason}")).await;
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "failover", "MQTT event: {}", event_str);
                true
            }
        }
    }

    /// End the session: fail the pending request and report the loss
    async fn close(shared: &Shared, reason: &str) {
        let previous = shared
            .state_tx
            .send_replace(LinkState::Closed(reason.to_string()));
        shared.acks.lock().await.fail(reason);

        let was_connected = previous == LinkState::Connected;
        if was_connected && !shared.closing.load(Ordering::SeqCst) {
            warn!(
                endpoint = %shared.endpoint,
                connection_id = shared.connection_id,
                "MQTT connection lost: {}",
                reason
            );
            let _ = shared.events.send(TransportEvent::Disconnected {
                connection_id: shared.connection_id,
                reason: reason.to_string(),
            });
        }
    }

    async fn connected_client(&self) -> Result<AsyncClient, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Wait for the pending request's acknowledgment
    async fn await_ack(
        &self,
        rx: oneshot::Receiver<AckResult>,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(AckFailure::Rejected(reason)))) => Err(TransportError::Rejected(reason)),
            Ok(Ok(Err(AckFailure::Closed(reason)))) => Err(TransportError::ConnectionLost(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "Acknowledgment channel closed".to_string(),
            )),
            Err(_) => {
                self.shared.acks.lock().await.clear();
                Err(TransportError::AckTimeout(ack_timeout))
            }
        }
    }
}

#[async_trait]
impl TransportBinding for MqttBinding {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut handle_guard = self.event_loop_handle.lock().await;
        if handle_guard.is_some() {
            return Err(TransportError::InvalidConfig(
                "Binding already used for a connection attempt".to_string(),
            ));
        }

        let mqtt_options = configure_mqtt_options(&self.shared.endpoint, &self.settings);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = Some(client);

        let handle = tokio::spawn(Self::run_event_loop(
            self.shared.clone(),
            event_loop,
            self.shutdown_tx.subscribe(),
        ));
        *handle_guard = Some(handle);
        drop(handle_guard);

        let result = Self::wait_for_connection_confirmation(
            self.state_rx.clone(),
            &self.shared.endpoint,
            timeout,
        )
        .await;

        if result.is_err() {
            self.shared.closing.store(true, Ordering::SeqCst);
            self.shutdown_tx.send_replace(true);
        }
        result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        let _request = self.request_lock.lock().await;
        let client = self.connected_client().await?;

        let rx = self.shared.acks.lock().await.begin(RequestKind::Publish, qos);
        if let Err(e) = client
            .publish(topic, to_mqtt_qos(qos), false, payload.to_vec())
            .await
        {
            self.shared.acks.lock().await.clear();
            return Err(TransportError::PublishFailed(e.to_string()));
        }

        self.await_ack(rx, ack_timeout).await?;
        debug!(target: "failover", "Published {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        let _request = self.request_lock.lock().await;
        let client = self.connected_client().await?;

        let rx = self
            .shared
            .acks
            .lock()
            .await
            .begin(RequestKind::Subscribe, qos);
        if let Err(e) = client.subscribe(filter, to_mqtt_qos(qos)).await {
            self.shared.acks.lock().await.clear();
            return Err(TransportError::SubscriptionFailed(e.to_string()));
        }

        self.await_ack(rx, ack_timeout).await
    }

    async fn unsubscribe(
        &self,
        filter: &str,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        let _request = self.request_lock.lock().await;
        let client = self.connected_client().await?;

        let rx = self
            .shared
            .acks
            .lock()
            .await
            .begin(RequestKind::Unsubscribe, DeliveryQos::AtLeastOnce);
        if let Err(e) = client.unsubscribe(filter).await {
            self.shared.acks.lock().await.clear();
            return Err(TransportError::SubscriptionFailed(e.to_string()));
        }

        self.await_ack(rx, ack_timeout).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.closing.store(true, Ordering::SeqCst);

        if let Some(client) = self.client.lock().await.take() {
            // Queue DISCONNECT without blocking on a full request channel
            if let Err(e) = client.try_disconnect() {
                debug!(target: "failover", "DISCONNECT not queued: {}", e);
            }
        }

        let handle = self.event_loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let graceful = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                let mut state_rx = self.state_rx.clone();
                while !matches!(*state_rx.borrow_and_update(), LinkState::Closed(_)) {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if graceful.is_err() {
                warn!(
                    endpoint = %self.shared.endpoint,
                    "Event loop did not close gracefully, forcing shutdown"
                );
            }

            self.shutdown_tx.send_replace(true);
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("Event loop task did not stop in time");
            }
        }

        info!(endpoint = %self.shared.endpoint, "MQTT binding disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), LinkState::Connected)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }
}

impl Drop for MqttBinding {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}

/// Builds [`MqttBinding`]s from the `[client]` configuration section
#[derive(Debug, Clone)]
pub struct MqttTransportFactory {
    settings: ClientSection,
}

impl MqttTransportFactory {
    pub fn new(settings: ClientSection) -> Self {
        Self { settings }
    }
}

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        connection_id: u64,
        events: EventSender,
    ) -> Result<Arc<dyn TransportBinding>, TransportError> {
        Ok(Arc::new(MqttBinding::new(
            endpoint.clone(),
            connection_id,
            self.settings.clone(),
            events,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn binding() -> (MqttBinding, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = MqttBinding::new(
            Endpoint::new("127.0.0.1", 1),
            7,
            ClientSection::default(),
            tx,
        );
        (binding, rx)
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (binding, _rx) = binding();
        assert!(!binding.is_connected());
        assert_eq!(binding.connection_id(), 7);

        let result = binding
            .publish("t", b"x", DeliveryQos::AtLeastOnce, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));

        let result = binding
            .subscribe("t/#", DeliveryQos::AtLeastOnce, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_times_out() {
        let (_tx, rx) = watch::channel(LinkState::Connecting);
        let endpoint = Endpoint::new("localhost", 1883);
        let result =
            MqttBinding::wait_for_connection_confirmation(rx, &endpoint, Duration::from_millis(20))
                .await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_sees_connected() {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        let endpoint = Endpoint::new("localhost", 1883);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(LinkState::Connected);
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let result =
            MqttBinding::wait_for_connection_confirmation(rx, &endpoint, Duration::from_secs(1))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_reports_close_reason() {
        let (_tx, rx) = watch::channel(LinkState::Closed("refused".to_string()));
        let endpoint = Endpoint::new("localhost", 1883);
        let result =
            MqttBinding::wait_for_connection_confirmation(rx, &endpoint, Duration::from_secs(1))
                .await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed { reason, .. }) if reason == "refused"
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_without_disconnect_event() {
        let (binding, mut rx) = binding();
        let result = binding.connect(Duration::from_secs(2)).await;
        assert!(result.is_err());
        assert!(!binding.is_connected());

        binding.disconnect().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broker_rejection_fails_pending_request() {
        let (binding, _rx) = binding();
        let ack = binding
            .shared
            .acks
            .lock()
            .await
            .begin(RequestKind::Publish, DeliveryQos::AtLeastOnce);

        let sent = EventRoute::RequestSent {
            kind: RequestKind::Publish,
            pkid: 1,
        };
        assert!(MqttBinding::process_event_route(&binding.shared, sent).await);
        let rejected = EventRoute::RequestRejected {
            kind: RequestKind::Publish,
            pkid: 1,
            reason: "PubAck NotAuthorized".to_string(),
        };
        assert!(MqttBinding::process_event_route(&binding.shared, rejected).await);

        let result = binding.await_ack(ack, Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(TransportError::Rejected(reason)) if reason.contains("NotAuthorized")
        ));
    }

    #[tokio::test]
    async fn test_factory_assigns_connection_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = MqttTransportFactory::new(ClientSection::default());
        let binding = factory
            .create(&Endpoint::new("localhost", 1883), 42, tx)
            .unwrap();
        assert_eq!(binding.endpoint(), &Endpoint::new("localhost", 1883));
        assert!(!binding.is_connected());
    }
}
