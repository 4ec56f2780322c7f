//! Pure routing of rumqttc events
//!
//! The event loop task maps every `Event` to an [`EventRoute`] and acts on
//! the route. Keeping the mapping pure lets it be tested without a broker.

use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, PubCompReason, PubRecReason, SubscribeReasonCode,
    UnsubAckReason,
};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Client requests that wait for a broker acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Broker answered ConnAck with a failure code
    ConnectionRefused(String),
    /// Application message on a subscribed filter
    MessageReceived { topic: String, payload: Vec<u8> },
    /// A request left the client with this packet id
    RequestSent { kind: RequestKind, pkid: u16 },
    /// Final acknowledgment for a request (PubAck, PubComp, SubAck, UnsubAck)
    RequestAcknowledged { kind: RequestKind, pkid: u16 },
    /// Broker answered a request with a failure reason code
    RequestRejected {
        kind: RequestKind,
        pkid: u16,
        reason: String,
    },
    /// Broker sent DISCONNECT
    Disconnected(String),
    /// Keep-alive and intermediate QoS 2 traffic
    InfrastructureEvent(String),
}

pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => Self::route_incoming(incoming),
            Event::Outgoing(outgoing) => Self::route_outgoing(outgoing),
        }
    }

    fn route_incoming(packet: &Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(connack) => match connack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                ref code => EventRoute::ConnectionRefused(format!("{code:?}")),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
            },
            Packet::PubAck(puback) => match puback.reason {
                PubAckReason::Success | PubAckReason::NoMatchingSubscribers => {
                    Self::acknowledged(RequestKind::Publish, puback.pkid)
                }
                reason => Self::rejected(RequestKind::Publish, puback.pkid, "PubAck", &reason),
            },
            // A refused PubRec ends the QoS 2 flow; no PubComp follows
            Packet::PubRec(pubrec) => match pubrec.reason {
                PubRecReason::Success | PubRecReason::NoMatchingSubscribers => {
                    EventRoute::InfrastructureEvent(format!("{pubrec:?}"))
                }
                reason => Self::rejected(RequestKind::Publish, pubrec.pkid, "PubRec", &reason),
            },
            Packet::PubComp(pubcomp) => match pubcomp.reason {
                PubCompReason::Success => Self::acknowledged(RequestKind::Publish, pubcomp.pkid),
                reason => Self::rejected(RequestKind::Publish, pubcomp.pkid, "PubComp", &reason),
            },
            Packet::SubAck(suback) => {
                match suback
                    .return_codes
                    .iter()
                    .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                {
                    None => Self::acknowledged(RequestKind::Subscribe, suback.pkid),
                    Some(code) => {
                        Self::rejected(RequestKind::Subscribe, suback.pkid, "SubAck", code)
                    }
                }
            }
            Packet::UnsubAck(unsuback) => {
                match unsuback.reasons.iter().find(|reason| {
                    !matches!(
                        reason,
                        UnsubAckReason::Success | UnsubAckReason::NoSubscriptionExisted
                    )
                }) {
                    None => Self::acknowledged(RequestKind::Unsubscribe, unsuback.pkid),
                    Some(reason) => {
                        Self::rejected(RequestKind::Unsubscribe, unsuback.pkid, "UnsubAck", reason)
                    }
                }
            }
            Packet::Disconnect(disconnect) => {
                EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
            }
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        }
    }

    fn acknowledged(kind: RequestKind, pkid: u16) -> EventRoute {
        EventRoute::RequestAcknowledged { kind, pkid }
    }

    fn rejected(
        kind: RequestKind,
        pkid: u16,
        packet: &str,
        code: &dyn std::fmt::Debug,
    ) -> EventRoute {
        EventRoute::RequestRejected {
            kind,
            pkid,
            reason: format!("{packet} {code:?}"),
        }
    }

    fn route_outgoing(outgoing: &Outgoing) -> EventRoute {
        match outgoing {
            Outgoing::Publish(pkid) => EventRoute::RequestSent {
                kind: RequestKind::Publish,
                pkid: *pkid,
            },
            Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                kind: RequestKind::Subscribe,
                pkid: *pkid,
            },
            Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                kind: RequestKind::Unsubscribe,
                pkid: *pkid,
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, Disconnect, DisconnectReasonCode, PubAck, PubComp, PubRec, Publish, SubAck,
        UnsubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected(reason) if reason.contains("ServerShuttingDown")
        ));
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("ha/cluster/test"),
            pkid: 1,
            payload: Bytes::from("hello"),
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "ha/cluster/test".to_string(),
                payload: b"hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_outgoing_requests() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(7))),
            EventRoute::RequestSent {
                kind: RequestKind::Publish,
                pkid: 7
            }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(8))),
            EventRoute::RequestSent {
                kind: RequestKind::Subscribe,
                pkid: 8
            }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Unsubscribe(9))),
            EventRoute::RequestSent {
                kind: RequestKind::Unsubscribe,
                pkid: 9
            }
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_route_puback_reason_codes() {
        let puback = |reason| {
            Event::Incoming(Packet::PubAck(PubAck {
                pkid: 3,
                reason,
                properties: None,
            }))
        };

        for reason in [PubAckReason::Success, PubAckReason::NoMatchingSubscribers] {
            assert_eq!(
                MessageHandler::route_mqtt_event(&puback(reason)),
                EventRoute::RequestAcknowledged {
                    kind: RequestKind::Publish,
                    pkid: 3
                }
            );
        }
        for reason in [
            PubAckReason::NotAuthorized,
            PubAckReason::QuotaExceeded,
            PubAckReason::UnspecifiedError,
        ] {
            assert!(matches!(
                MessageHandler::route_mqtt_event(&puback(reason)),
                EventRoute::RequestRejected { kind: RequestKind::Publish, pkid: 3, reason }
                    if reason.starts_with("PubAck")
            ));
        }
    }

    #[test]
    fn test_route_qos2_reason_codes() {
        let pubrec = Event::Incoming(Packet::PubRec(PubRec {
            pkid: 4,
            reason: PubRecReason::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&pubrec),
            EventRoute::InfrastructureEvent(_)
        ));

        let refused = Event::Incoming(Packet::PubRec(PubRec {
            pkid: 4,
            reason: PubRecReason::NotAuthorized,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::RequestRejected { kind: RequestKind::Publish, pkid: 4, .. }
        ));

        let lost = Event::Incoming(Packet::PubComp(PubComp {
            pkid: 4,
            reason: PubCompReason::PacketIdentifierNotFound,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&lost),
            EventRoute::RequestRejected { kind: RequestKind::Publish, pkid: 4, .. }
        ));
    }

    #[test]
    fn test_route_suback_reason_codes() {
        let granted = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 6,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&granted),
            EventRoute::RequestAcknowledged {
                kind: RequestKind::Subscribe,
                pkid: 6
            }
        );

        let refused = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 6,
            return_codes: vec![SubscribeReasonCode::NotAuthorized],
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::RequestRejected { kind: RequestKind::Subscribe, pkid: 6, reason }
                if reason.contains("NotAuthorized")
        ));
    }

    #[test]
    fn test_route_unsuback_reason_codes() {
        let unsuback = |reason| {
            Event::Incoming(Packet::UnsubAck(UnsubAck {
                pkid: 9,
                reasons: vec![reason],
                properties: None,
            }))
        };

        assert!(matches!(
            MessageHandler::route_mqtt_event(&unsuback(UnsubAckReason::NoSubscriptionExisted)),
            EventRoute::RequestAcknowledged { kind: RequestKind::Unsubscribe, pkid: 9 }
        ));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&unsuback(UnsubAckReason::TopicFilterInvalid)),
            EventRoute::RequestRejected { kind: RequestKind::Unsubscribe, pkid: 9, .. }
        ));
    }
}
