use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::websocket::registry::Session;

/// Client-to-server operations over a live session.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    #[serde(rename = "join_room")]
    JoinRoom { room_id: String },
    #[serde(rename = "leave_room")]
    LeaveRoom { room_id: String },
    /// Send a payload to a room or directly to a user. Exactly one target
    /// must be set.
    #[serde(rename = "send")]
    Send {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        recipient_user_id: Option<Uuid>,
        payload: Value,
    },
}

/// Handshake frame confirming registration.
pub fn connected_frame(session: &Session) -> String {
    serde_json::json!({
        "type": "connected",
        "session_id": session.session_id,
        "instance_id": session.instance_id,
        "timestamp": chrono::Utc::now().timestamp(),
    })
    .to_string()
}

/// Error frame pushed back to the offending session only.
pub fn error_frame(code: &str, message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_parses() {
        let evt: WsInboundEvent =
            serde_json::from_str(r#"{"type":"join_room","room_id":"a_b"}"#).unwrap();
        assert!(matches!(evt, WsInboundEvent::JoinRoom { room_id } if room_id == "a_b"));
    }

    #[test]
    fn test_send_accepts_either_target() {
        let to_room: WsInboundEvent =
            serde_json::from_str(r#"{"type":"send","room_id":"a_b","payload":"hi"}"#).unwrap();
        match to_room {
            WsInboundEvent::Send {
                room_id,
                recipient_user_id,
                payload,
            } => {
                assert_eq!(room_id.as_deref(), Some("a_b"));
                assert!(recipient_user_id.is_none());
                assert_eq!(payload, json!("hi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let recipient = uuid::Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"send","recipient_user_id":"{recipient}","payload":{{"text":"yo"}}}}"#
        );
        let to_user: WsInboundEvent = serde_json::from_str(&raw).unwrap();
        assert!(matches!(
            to_user,
            WsInboundEvent::Send { recipient_user_id: Some(r), .. } if r == recipient
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<WsInboundEvent>(r#"{"type":"dance"}"#).is_err());
    }
}
