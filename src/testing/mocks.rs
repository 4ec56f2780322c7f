//! Mock implementations for testing
//!
//! [`MockNetwork`] simulates a set of brokers that can be started, stopped or
//! made unresponsive at any time. [`MockTransportFactory`] hands out bindings
//! connected to it, so the whole failover client can be exercised without a
//! real broker.

use crate::pool::Endpoint;
use crate::store::{BufferedMessage, OfflineStore, StoreError};
use crate::topics::topic_matches_filter;
use crate::transport::{
    DeliveryQos, EventSender, TransportBinding, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How a simulated broker reacts to new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBehavior {
    /// Accepts connections and acknowledges everything
    Up,
    /// Refuses connections immediately
    Down,
    /// Never answers; connects time out
    Unresponsive,
}

/// A message a simulated broker acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub endpoint: Endpoint,
    pub topic: String,
    pub payload: Vec<u8>,
}

struct LiveLink {
    endpoint: Endpoint,
    connection_id: u64,
    events: EventSender,
    connected: Arc<AtomicBool>,
    filters: Vec<String>,
}

#[derive(Default)]
struct NetworkInner {
    behaviors: HashMap<Endpoint, BrokerBehavior>,
    rejected_subscribes: HashSet<Endpoint>,
    withheld_acks: HashSet<Endpoint>,
    ack_delays: HashMap<Endpoint, Duration>,
    drop_after_publishes: HashMap<Endpoint, usize>,
    received: Vec<ReceivedMessage>,
    connect_attempts: Vec<Endpoint>,
    links: Vec<LiveLink>,
}

/// Scriptable set of brokers shared by every mock binding
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints without an explicit behavior are `Down`
    pub async fn set_behavior(&self, endpoint: &Endpoint, behavior: BrokerBehavior) {
        self.inner
            .lock()
            .await
            .behaviors
            .insert(endpoint.clone(), behavior);
    }

    pub async fn start_broker(&self, endpoint: &Endpoint) {
        self.set_behavior(endpoint, BrokerBehavior::Up).await;
    }

    /// Refuse new connections and drop every live one with a `Disconnected` event
    pub async fn stop_broker(&self, endpoint: &Endpoint) {
        self.set_behavior(endpoint, BrokerBehavior::Down).await;
        self.drop_connections(endpoint).await;
    }

    /// Drop live connections to `endpoint` without changing its behavior
    pub async fn drop_connections(&self, endpoint: &Endpoint) {
        let mut inner = self.inner.lock().await;
        let (dropped, kept): (Vec<LiveLink>, Vec<LiveLink>) = inner
            .links
            .drain(..)
            .partition(|link| &link.endpoint == endpoint);
        inner.links = kept;

        for link in dropped {
            link.connected.store(false, Ordering::SeqCst);
            let _ = link.events.send(TransportEvent::Disconnected {
                connection_id: link.connection_id,
                reason: format!("Broker {endpoint} stopped"),
            });
        }
    }

    /// Make subscribe requests against `endpoint` fail
    pub async fn reject_subscribes(&self, endpoint: &Endpoint, reject: bool) {
        let mut inner = self.inner.lock().await;
        if reject {
            inner.rejected_subscribes.insert(endpoint.clone());
        } else {
            inner.rejected_subscribes.remove(endpoint);
        }
    }

    /// Accept publishes and subscribes on `endpoint` but never acknowledge them
    pub async fn withhold_acks(&self, endpoint: &Endpoint, withhold: bool) {
        let mut inner = self.inner.lock().await;
        if withhold {
            inner.withheld_acks.insert(endpoint.clone());
        } else {
            inner.withheld_acks.remove(endpoint);
        }
    }

    /// Hold every publish and subscribe on `endpoint` for `delay` before
    /// acknowledging it
    pub async fn set_ack_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.inner
            .lock()
            .await
            .ack_delays
            .insert(endpoint.clone(), delay);
    }

    /// Drop live connections to `endpoint` right after its next `count` publishes
    /// have been acknowledged
    pub async fn drop_after_publishes(&self, endpoint: &Endpoint, count: usize) {
        self.inner
            .lock()
            .await
            .drop_after_publishes
            .insert(endpoint.clone(), count);
    }

    /// Deliver an inbound message to every live subscriber on `endpoint`
    pub async fn inject_message(&self, endpoint: &Endpoint, topic: &str, payload: &[u8]) -> usize {
        let inner = self.inner.lock().await;
        let mut delivered = 0;
        for link in inner.links.iter().filter(|link| &link.endpoint == endpoint) {
            if link
                .filters
                .iter()
                .any(|filter| topic_matches_filter(filter, topic))
            {
                let _ = link.events.send(TransportEvent::Message {
                    connection_id: link.connection_id,
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn received_messages(&self) -> Vec<ReceivedMessage> {
        self.inner.lock().await.received.clone()
    }

    pub async fn received_payloads(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .await
            .received
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub async fn connect_attempts(&self) -> Vec<Endpoint> {
        self.inner.lock().await.connect_attempts.clone()
    }

    /// Filters held by live connections to `endpoint`
    pub async fn subscriptions(&self, endpoint: &Endpoint) -> Vec<String> {
        self.inner
            .lock()
            .await
            .links
            .iter()
            .filter(|link| &link.endpoint == endpoint)
            .flat_map(|link| link.filters.clone())
            .collect()
    }

    pub async fn live_connections(&self) -> usize {
        self.inner.lock().await.links.len()
    }
}

/// Binding to one simulated broker
pub struct MockBinding {
    endpoint: Endpoint,
    connection_id: u64,
    events: EventSender,
    network: MockNetwork,
    connected: Arc<AtomicBool>,
}

impl MockBinding {
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl TransportBinding for MockBinding {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        let behavior = {
            let mut inner = self.network.inner.lock().await;
            inner.connect_attempts.push(self.endpoint.clone());
            inner
                .behaviors
                .get(&self.endpoint)
                .copied()
                .unwrap_or(BrokerBehavior::Down)
        };

        match behavior {
            BrokerBehavior::Down => Err(TransportError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: "Connection refused".to_string(),
            }),
            BrokerBehavior::Unresponsive => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::ConnectTimeout {
                    endpoint: self.endpoint.clone(),
                    timeout,
                })
            }
            BrokerBehavior::Up => {
                self.connected.store(true, Ordering::SeqCst);
                self.network.inner.lock().await.links.push(LiveLink {
                    endpoint: self.endpoint.clone(),
                    connection_id: self.connection_id,
                    events: self.events.clone(),
                    connected: self.connected.clone(),
                    filters: Vec::new(),
                });
                let _ = self.events.send(TransportEvent::Connected {
                    connection_id: self.connection_id,
                });
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        _qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let (withheld, delay) = {
            let inner = self.network.inner.lock().await;
            (
                inner.withheld_acks.contains(&self.endpoint),
                inner.ack_delays.get(&self.endpoint).copied(),
            )
        };
        if withheld {
            tokio::time::sleep(ack_timeout).await;
            return Err(TransportError::AckTimeout(ack_timeout));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_connected().await?;
        }

        let drop_now = {
            let mut inner = self.network.inner.lock().await;
            inner.received.push(ReceivedMessage {
                endpoint: self.endpoint.clone(),
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
            let exhausted = inner
                .drop_after_publishes
                .get_mut(&self.endpoint)
                .map(|remaining| {
                    *remaining = remaining.saturating_sub(1);
                    *remaining == 0
                })
                .unwrap_or(false);
            if exhausted {
                inner.drop_after_publishes.remove(&self.endpoint);
            }
            exhausted
        };
        if drop_now {
            self.network.drop_connections(&self.endpoint).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: DeliveryQos,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let (withheld, delay) = {
            let inner = self.network.inner.lock().await;
            (
                inner.withheld_acks.contains(&self.endpoint),
                inner.ack_delays.get(&self.endpoint).copied(),
            )
        };
        if withheld {
            tokio::time::sleep(ack_timeout).await;
            return Err(TransportError::AckTimeout(ack_timeout));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_connected().await?;
        }

        let mut inner = self.network.inner.lock().await;
        if inner.rejected_subscribes.contains(&self.endpoint) {
            return Err(TransportError::SubscriptionFailed(format!(
                "{filter} rejected by {}",
                self.endpoint
            )));
        }
        if let Some(link) = inner
            .links
            .iter_mut()
            .find(|link| link.connection_id == self.connection_id)
        {
            if !link.filters.iter().any(|f| f == filter) {
                link.filters.push(filter.to_string());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, _ack_timeout: Duration) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let mut inner = self.network.inner.lock().await;
        if let Some(link) = inner
            .links
            .iter_mut()
            .find(|link| link.connection_id == self.connection_id)
        {
            link.filters.retain(|f| f != filter);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let connection_id = self.connection_id;
        self.network
            .inner
            .lock()
            .await
            .links
            .retain(|link| link.connection_id != connection_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Factory producing [`MockBinding`]s on a shared [`MockNetwork`]
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    network: MockNetwork,
}

impl MockTransportFactory {
    pub fn new(network: MockNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        connection_id: u64,
        events: EventSender,
    ) -> Result<Arc<dyn TransportBinding>, TransportError> {
        Ok(Arc::new(MockBinding {
            endpoint: endpoint.clone(),
            connection_id,
            events,
            network: self.network.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Offline store whose medium is always unavailable
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl OfflineStore for FailingStore {
    async fn append(&self, _topic: &str, _payload: &[u8]) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("Mock storage failure".to_string()))
    }

    async fn drain_ordered(&self) -> Result<Vec<BufferedMessage>, StoreError> {
        Err(StoreError::Unavailable("Mock storage failure".to_string()))
    }

    async fn remove(&self, _id: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("Mock storage failure".to_string()))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("Mock storage failure".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    #[tokio::test]
    async fn test_connect_follows_behavior() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(network.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let down = factory.create(&ep(1883), 1, tx.clone()).unwrap();
        assert!(down.connect(Duration::from_millis(10)).await.is_err());

        network.start_broker(&ep(1884)).await;
        let up = factory.create(&ep(1884), 2, tx).unwrap();
        up.connect(Duration::from_millis(10)).await.unwrap();
        assert!(up.is_connected());
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Connected { connection_id: 2 })
        );
        assert_eq!(network.connect_attempts().await, vec![ep(1883), ep(1884)]);
    }

    #[tokio::test]
    async fn test_stop_broker_emits_disconnect() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(network.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.start_broker(&ep(1883)).await;

        let binding = factory.create(&ep(1883), 5, tx).unwrap();
        binding.connect(Duration::from_millis(10)).await.unwrap();
        let _connected = rx.recv().await;

        network.stop_broker(&ep(1883)).await;
        assert!(!binding.is_connected());
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { connection_id: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_inject_message_respects_filters() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(network.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.start_broker(&ep(1883)).await;

        let binding = factory.create(&ep(1883), 1, tx).unwrap();
        binding.connect(Duration::from_millis(10)).await.unwrap();
        let _connected = rx.recv().await;
        binding
            .subscribe("ha/#", DeliveryQos::AtLeastOnce, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(network.inject_message(&ep(1883), "other/topic", b"x").await, 0);
        assert_eq!(network.inject_message(&ep(1883), "ha/cluster/test", b"y").await, 1);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Message { topic, .. }) if topic == "ha/cluster/test"
        ));
    }

    #[tokio::test]
    async fn test_drop_after_publishes_disconnects_once() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(network.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.start_broker(&ep(1883)).await;
        network.drop_after_publishes(&ep(1883), 2).await;

        let binding = factory.create(&ep(1883), 1, tx).unwrap();
        binding.connect(Duration::from_millis(10)).await.unwrap();
        let _connected = rx.recv().await;

        let timeout = Duration::from_millis(10);
        binding.publish("t", b"1", DeliveryQos::AtLeastOnce, timeout).await.unwrap();
        assert!(binding.is_connected());
        binding.publish("t", b"2", DeliveryQos::AtLeastOnce, timeout).await.unwrap();
        assert!(!binding.is_connected());
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { connection_id: 1, .. })
        ));
        assert!(matches!(
            binding.publish("t", b"3", DeliveryQos::AtLeastOnce, timeout).await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(network.received_payloads().await, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn test_withheld_acks_time_out_subscribes() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(network.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        network.start_broker(&ep(1883)).await;
        network.withhold_acks(&ep(1883), true).await;

        let binding = factory.create(&ep(1883), 1, tx).unwrap();
        binding.connect(Duration::from_millis(10)).await.unwrap();

        let result = binding
            .subscribe("a/b", DeliveryQos::AtLeastOnce, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(TransportError::AckTimeout(_))));
        assert!(network.subscriptions(&ep(1883)).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = FailingStore;
        assert!(store.append("t", b"x").await.is_err());
        assert!(store.len().await.is_err());
    }
}
