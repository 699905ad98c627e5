//! JSON wire envelopes exchanged with clients.
//!
//! Inbound frames are `{"type": ..., "data": ...}`; outbound frames add the
//! recipient as `user_id`. The payload is opaque to the delivery core.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ConnectionId, UserId};

/// An outbound notification. Immutable once built and shared between
/// recipients behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// When set, delivery targets this user's connections instead of a topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<UserId>,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            target_user: None,
        }
    }

    /// Restrict delivery to a single user.
    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.target_user = Some(user_id);
        self
    }

    /// Error notice sent back to a client whose inbound frame was rejected by the limiter.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            "error",
            json!({ "code": "rate_limited", "retry_after": retry_after_secs }),
        )
    }
}

/// Outbound frame as written to the socket.
#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    user_id: UserId,
    data: &'a Value,
}

/// Encode a notification for a specific recipient.
pub fn encode_outbound(notification: &Notification, recipient: UserId) -> serde_json::Result<String> {
    serde_json::to_string(&OutboundFrame {
        kind: &notification.kind,
        user_id: recipient,
        data: &notification.data,
    })
}

/// Minimal envelope every inbound client frame must carry.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

pub fn decode_inbound(text: &str) -> serde_json::Result<InboundEnvelope> {
    serde_json::from_str(text)
}

/// A decoded client frame tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub kind: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_outbound_frame_carries_recipient() {
        let user = Uuid::new_v4();
        let n = Notification::new("message", json!({"content": "hi"}));
        let encoded = encode_outbound(&n, user).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["user_id"], user.to_string());
        assert_eq!(value["data"]["content"], "hi");
    }

    #[test]
    fn test_target_hint_stays_off_the_wire() {
        let user = Uuid::new_v4();
        let n = Notification::new("message", Value::Null).for_user(user);
        let encoded = encode_outbound(&n, user).unwrap();
        assert!(!encoded.contains("target_user"));
    }

    #[test]
    fn test_decode_inbound_envelope() {
        let env = decode_inbound(r#"{"type":"message","data":{"content":"x"}}"#).unwrap();
        assert_eq!(env.kind, "message");
        assert_eq!(env.data["content"], "x");

        let bare = decode_inbound(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(bare.data, Value::Null);
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        assert!(decode_inbound(r#"{"data":1}"#).is_err());
        assert!(decode_inbound("not json").is_err());
    }

    #[test]
    fn test_notification_relay_roundtrip_keeps_hint() {
        let user = Uuid::new_v4();
        let n = Notification::new("conversation_updated", json!({"id": 1})).for_user(user);
        let text = serde_json::to_string(&n).unwrap();
        let back: Notification = serde_json::from_str(&text).unwrap();
        assert_eq!(back, n);
    }
}
