//! Matching broker acknowledgments to the one request in flight
//!
//! Requests on a binding are serialized, so at most one is pending. Its packet
//! id is unknown until the event loop reports the outgoing packet; only an
//! acknowledgment of the same kind and packet id completes it. Anything else
//! is a stale ack from an abandoned request and is ignored.

use super::message_handler::RequestKind;
use crate::transport::DeliveryQos;
use tokio::sync::oneshot;
use tracing::debug;

/// Why a request will never be acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFailure {
    /// Broker answered with a failure reason code
    Rejected(String),
    /// Connection ended first
    Closed(String),
}

pub type AckResult = Result<(), AckFailure>;

struct PendingRequest {
    kind: RequestKind,
    qos: DeliveryQos,
    pkid: Option<u16>,
    done: oneshot::Sender<AckResult>,
}

#[derive(Default)]
pub struct AckTracker {
    pending: Option<PendingRequest>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before handing it to the client
    pub fn begin(&mut self, kind: RequestKind, qos: DeliveryQos) -> oneshot::Receiver<AckResult> {
        let (done, rx) = oneshot::channel();
        self.pending = Some(PendingRequest {
            kind,
            qos,
            pkid: None,
            done,
        });
        rx
    }

    /// The event loop wrote the request to the socket
    pub fn on_sent(&mut self, kind: RequestKind, pkid: u16) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.kind != kind || pending.pkid.is_some() {
            return;
        }

        // QoS 0 publishes have no acknowledgment
        if kind == RequestKind::Publish && pending.qos == DeliveryQos::AtMostOnce {
            self.complete(Ok(()));
        } else {
            pending.pkid = Some(pkid);
        }
    }

    pub fn on_ack(&mut self, kind: RequestKind, pkid: u16) {
        self.settle(kind, pkid, Ok(()));
    }

    /// Broker refused the request with a failure reason code
    pub fn on_reject(&mut self, kind: RequestKind, pkid: u16, reason: &str) {
        self.settle(kind, pkid, Err(AckFailure::Rejected(reason.to_string())));
    }

    /// Connection ended; the pending request can never be acknowledged
    pub fn fail(&mut self, reason: &str) {
        self.complete(Err(AckFailure::Closed(reason.to_string())));
    }

    /// Forget the pending request after its caller gave up waiting
    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn settle(&mut self, kind: RequestKind, pkid: u16, result: AckResult) {
        let expected = matches!(
            &self.pending,
            Some(pending) if pending.kind == kind && pending.pkid == Some(pkid)
        );
        if expected {
            self.complete(result);
        } else {
            debug!(target: "failover", "Ignoring stale {:?} ack for packet {}", kind, pkid);
        }
    }

    fn complete(&mut self, result: AckResult) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos1_publish_completes_on_matching_puback() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Publish, DeliveryQos::AtLeastOnce);

        tracker.on_sent(RequestKind::Publish, 5);
        tracker.on_ack(RequestKind::Publish, 4);
        assert!(tracker.has_pending());

        tracker.on_ack(RequestKind::Publish, 5);
        assert!(!tracker.has_pending());
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_when_sent() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Publish, DeliveryQos::AtMostOnce);
        tracker.on_sent(RequestKind::Publish, 0);
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_ack_of_other_kind_ignored() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Subscribe, DeliveryQos::AtLeastOnce);
        tracker.on_sent(RequestKind::Subscribe, 1);
        tracker.on_ack(RequestKind::Publish, 1);
        assert!(tracker.has_pending());

        tracker.on_ack(RequestKind::Subscribe, 1);
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_ack_before_send_ignored() {
        let mut tracker = AckTracker::new();
        let _rx = tracker.begin(RequestKind::Publish, DeliveryQos::AtLeastOnce);
        tracker.on_ack(RequestKind::Publish, 1);
        assert!(tracker.has_pending());
    }

    #[tokio::test]
    async fn test_fail_reports_reason() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Publish, DeliveryQos::ExactlyOnce);
        tracker.on_sent(RequestKind::Publish, 2);
        tracker.fail("connection reset");
        assert_eq!(
            rx.await.unwrap(),
            Err(AckFailure::Closed("connection reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_reject_completes_matching_request_with_reason() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Subscribe, DeliveryQos::AtLeastOnce);
        tracker.on_sent(RequestKind::Subscribe, 3);

        tracker.on_reject(RequestKind::Subscribe, 2, "SubAck NotAuthorized");
        assert!(tracker.has_pending());

        tracker.on_reject(RequestKind::Subscribe, 3, "SubAck NotAuthorized");
        assert!(!tracker.has_pending());
        assert_eq!(
            rx.await.unwrap(),
            Err(AckFailure::Rejected("SubAck NotAuthorized".to_string()))
        );
    }

    #[tokio::test]
    async fn test_clear_drops_sender() {
        let mut tracker = AckTracker::new();
        let rx = tracker.begin(RequestKind::Unsubscribe, DeliveryQos::AtLeastOnce);
        tracker.clear();
        assert!(rx.await.is_err());
    }
}
