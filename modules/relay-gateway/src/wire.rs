//! Gateway wire protocol: JSON text frames tagged by `op`.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// One frame on the gateway socket. The op set is closed; frames with an
/// unrecognized op fail deserialization and are rejected at the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum GatewayMessage {
    /// First frame from the platform; negotiates the heartbeat interval.
    Hello { heartbeat_interval_ms: u64 },
    /// Fresh authentication.
    Identify { token: String },
    /// Re-authentication with sequence continuity.
    Resume {
        token: String,
        session_id: String,
        last_seq: u64,
    },
    /// Liveness ping. Sent by us on the negotiated interval; the platform
    /// may also request one.
    Heartbeat { last_seq: Option<u64> },
    HeartbeatAck,
    /// An event. `t` names the event type, `d` carries its body.
    Dispatch {
        seq: u64,
        #[serde(rename = "t")]
        event_type: String,
        #[serde(rename = "d")]
        data: serde_json::Value,
    },
    /// The platform rejected our session. Resumable sessions may retry
    /// with `resume`; otherwise a fresh identify is required.
    InvalidSession { resumable: bool },
    /// The platform asks us to reconnect (it keeps the session alive).
    Reconnect,
}

/// Event types carried inside `dispatch` frames. Closed set, matched
/// exhaustively by the session; unknown types are rejected with a warning
/// rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// Handshake completion; carries the resume identity.
    Ready { session_id: String },
    /// A resume request was accepted; replay follows. Carries an empty
    /// body on the wire.
    Resumed {},
    /// Durable state for a resource changed upstream.
    RecordUpserted {
        resource_key: String,
        body: serde_json::Value,
    },
    /// Durable state for a resource was removed upstream.
    RecordRetracted {
        resource_key: String,
        body: serde_json::Value,
    },
    /// The platform asks us to push an outbound delivery.
    DeliveryRequested {
        resource_key: String,
        body: serde_json::Value,
    },
    /// Presence chatter. Carried on the socket, produces no Command.
    PresenceSync { resource_key: String },
}

impl DispatchEvent {
    /// Parse the `t`/`d` pair of a dispatch frame.
    pub fn parse(event_type: &str, data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "t": event_type, "d": data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_serialize_with_kebab_case_tags() {
        let json = serde_json::to_value(GatewayMessage::HeartbeatAck).unwrap();
        assert_eq!(json["op"], "heartbeat-ack");

        let json = serde_json::to_value(GatewayMessage::InvalidSession { resumable: true }).unwrap();
        assert_eq!(json["op"], "invalid-session");
    }

    #[test]
    fn dispatch_frame_round_trips() {
        let msg = GatewayMessage::Dispatch {
            seq: 42,
            event_type: "record_upserted".into(),
            data: serde_json::json!({"resource_key": "r1", "body": {"x": 1}}),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: GatewayMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_op_fails_deserialization() {
        let parsed: Result<GatewayMessage, _> =
            serde_json::from_str(r#"{"op": "telepathy", "seq": 1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn known_event_types_parse() {
        let event = DispatchEvent::parse(
            "record_upserted",
            &serde_json::json!({"resource_key": "chan-1", "body": {"x": 1}}),
        )
        .unwrap();
        assert_eq!(
            event,
            DispatchEvent::RecordUpserted {
                resource_key: "chan-1".into(),
                body: serde_json::json!({"x": 1}),
            }
        );

        let ready =
            DispatchEvent::parse("ready", &serde_json::json!({"session_id": "s1"})).unwrap();
        assert_eq!(
            ready,
            DispatchEvent::Ready {
                session_id: "s1".into()
            }
        );

        let resumed = DispatchEvent::parse("resumed", &serde_json::json!({})).unwrap();
        assert_eq!(resumed, DispatchEvent::Resumed {});
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let parsed = DispatchEvent::parse("mystery_event", &serde_json::json!({}));
        assert!(parsed.is_err());
    }
}
