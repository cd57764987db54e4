use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Classification of a fanout event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Like,
    Comment,
    Follow,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Like => "like",
            EventType::Comment => "comment",
            EventType::Follow => "follow",
            EventType::Custom => "custom",
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "message" => Ok(EventType::Message),
            "like" => Ok(EventType::Like),
            "comment" => Ok(EventType::Comment),
            "follow" => Ok(EventType::Follow),
            "custom" => Ok(EventType::Custom),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A single fanout event. Immutable once created; `event_id` is the
/// idempotency key consumers dedup on, so the same event observed twice
/// (broker redelivery, offline drain after a live push) must be ignorable.
///
/// Exactly one of `recipient_user_id` / `room_id` is required for routing;
/// pair-chat messages carry both so the offline fallback knows which user
/// the durable copy belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Event addressed to a single user (notification path).
    pub fn to_user(
        event_type: EventType,
        recipient_user_id: Uuid,
        sender_user_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            recipient_user_id: Some(recipient_user_id),
            sender_user_id,
            room_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Event addressed to a room. `recipient_user_id` names the user the
    /// durable fallback is written for (the peer in a pair room); rooms
    /// without a single peer skip the fallback.
    pub fn to_room(
        room_id: String,
        recipient_user_id: Option<Uuid>,
        sender_user_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::Message,
            recipient_user_id,
            sender_user_id,
            room_id: Some(room_id),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// The outbound push shape written to every session:
/// `{event_id, type, payload, created_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PushMessage {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl From<&Event> for PushMessage {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type,
            payload: event.payload.clone(),
            created_at: event.created_at,
        }
    }
}

impl PushMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A persisted event awaiting an offline recipient. Never deleted here;
/// rows flip to `delivered = true` when the backlog is drained and any
/// retention policy belongs to the durable-store collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OfflineNotification {
    pub event_id: Uuid,
    pub recipient_user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    pub sender_user_id: Option<Uuid>,
    pub room_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OfflineNotification {
    pub fn from_event(event: &Event, recipient_user_id: Uuid) -> Self {
        Self {
            event_id: event.event_id,
            recipient_user_id,
            event_type: event.event_type,
            sender_user_id: event.sender_user_id,
            room_id: event.room_id.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
            delivered: false,
            delivered_at: None,
        }
    }

    pub fn push_message(&self) -> PushMessage {
        PushMessage {
            event_id: self.event_id,
            event_type: self.event_type,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_round_trip() {
        for ty in ["message", "like", "comment", "follow", "custom"] {
            let parsed = EventType::try_from(ty.to_string()).unwrap();
            assert_eq!(parsed.as_str(), ty);
        }
        assert!(EventType::try_from("poke".to_string()).is_err());
    }

    #[test]
    fn test_event_serialization_uses_type_tag() {
        let recipient = Uuid::new_v4();
        let event = Event::to_user(EventType::Like, recipient, None, json!({"post_id": 7}));

        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "like");
        assert_eq!(value["recipient_user_id"], recipient.to_string());
        // absent optionals are omitted, not null
        assert!(value.get("sender_user_id").is_none());
        assert!(value.get("room_id").is_none());
    }

    #[test]
    fn test_push_message_shape() {
        let event = Event::to_user(
            EventType::Follow,
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            json!({"follower": "b"}),
        );
        let push = PushMessage::from(&event);
        let value: Value = serde_json::to_value(&push).unwrap();

        assert_eq!(value["event_id"], event.event_id.to_string());
        assert_eq!(value["type"], "follow");
        assert_eq!(value["payload"]["follower"], "b");
        assert!(value["created_at"].is_string());
        // the push shape carries no addressing fields
        assert!(value.get("recipient_user_id").is_none());
    }

    #[test]
    fn test_offline_notification_preserves_event_id() {
        let recipient = Uuid::new_v4();
        let event = Event::to_user(EventType::Comment, recipient, None, json!({"text": "hi"}));
        let note = OfflineNotification::from_event(&event, recipient);

        assert_eq!(note.event_id, event.event_id);
        assert!(!note.delivered);
        assert_eq!(note.push_message().event_id, event.event_id);
    }
}
