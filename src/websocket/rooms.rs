use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::PushMessage;
use crate::websocket::registry::{Session, SessionPushError};

/// Outcome of a local room broadcast. `torn_down` lists sessions that were
/// dropped from the room for being slow or gone; the caller unregisters them
/// from the connection registry.
#[derive(Debug, Default)]
pub struct RoomBroadcast {
    pub delivered: usize,
    pub torn_down: Vec<Uuid>,
}

/// Groups local sessions into named rooms for targeted broadcast.
///
/// A room's membership is conceptual fleet-wide state; this manager only
/// materializes the subset of sessions this instance physically holds.
/// Members on other instances are reached through the broker, never here.
#[derive(Clone, Default)]
pub struct RoomManager {
    rooms: Arc<DashMap<String, HashMap<Uuid, Session>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the room's local materialization; the room is
    /// created lazily on first join. Joining twice is a no-op.
    pub fn join(&self, room_id: &str, session: Session) {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .entry(session.session_id)
            .or_insert(session);
    }

    /// Idempotent removal. When the last local session leaves, the local
    /// materialization is released; the room id itself is caller policy and
    /// survives for the next join.
    pub fn leave(&self, room_id: &str, session_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room_id) {
            members.remove(&session_id);
        }
        self.rooms.remove_if(room_id, |_, members| members.is_empty());
    }

    /// Push to every locally-held session in the room. The returned count
    /// feeds the delivery router's decision about the durable fallback.
    pub fn broadcast_local(&self, room_id: &str, msg: &PushMessage) -> RoomBroadcast {
        let mut outcome = RoomBroadcast::default();

        let snapshot: Vec<Session> = match self.rooms.get(room_id) {
            Some(members) => members.values().cloned().collect(),
            None => return outcome,
        };

        for session in snapshot {
            match session.try_push(msg.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(SessionPushError::SlowConsumer) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        room_id = %room_id,
                        "room member buffer full, dropping slow consumer"
                    );
                    crate::metrics::SLOW_CONSUMER_DISCONNECTS_TOTAL.inc();
                    outcome.torn_down.push(session.session_id);
                }
                Err(SessionPushError::Closed) => outcome.torn_down.push(session.session_id),
            }
        }

        for session_id in &outcome.torn_down {
            self.leave(room_id, *session_id);
        }
        outcome
    }

    /// The users with at least one local session in the room.
    pub fn local_users(&self, room_id: &str) -> HashSet<Uuid> {
        self.rooms
            .get(room_id)
            .map(|members| members.values().map(|s| s.user_id).collect())
            .unwrap_or_default()
    }

    pub fn local_session_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Deterministic room id for a user pair: the same two users always land in
/// the same room, across reconnects and instances.
pub fn pair_room_id(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

/// The other member of a pair room, when `room_id` parses as one and `me`
/// is part of the pair.
pub fn peer_in_pair_room(room_id: &str, me: Uuid) -> Option<Uuid> {
    let (lo, hi) = room_id.split_once('_')?;
    let lo = Uuid::parse_str(lo).ok()?;
    let hi = Uuid::parse_str(hi).ok()?;
    if me == lo {
        Some(hi)
    } else if me == hi {
        Some(lo)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::registry::ConnectionRegistry;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn session(registry: &ConnectionRegistry, user_id: Uuid) -> (Session, mpsc::Receiver<PushMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let (session, _) = registry.register(user_id, tx);
        (session, rx)
    }

    fn push() -> PushMessage {
        use crate::models::{Event, EventType};
        PushMessage::from(&Event::to_user(
            EventType::Message,
            Uuid::new_v4(),
            None,
            json!({"text": "hi"}),
        ))
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let registry = ConnectionRegistry::new(Uuid::new_v4());
        let rooms = RoomManager::new();
        let (session, _rx) = session(&registry, Uuid::new_v4());

        rooms.join("a_b", session.clone());
        rooms.join("a_b", session.clone());

        assert_eq!(rooms.local_session_count("a_b"), 1);
    }

    #[tokio::test]
    async fn test_leave_unjoined_is_a_noop_and_empty_rooms_are_released() {
        let registry = ConnectionRegistry::new(Uuid::new_v4());
        let rooms = RoomManager::new();
        let (session, _rx) = session(&registry, Uuid::new_v4());

        // leaving before joining must not error
        rooms.leave("a_b", session.session_id);
        assert_eq!(rooms.room_count(), 0);

        rooms.join("a_b", session.clone());
        assert_eq!(rooms.room_count(), 1);
        rooms.leave("a_b", session.session_id);
        assert_eq!(rooms.room_count(), 0, "empty materialization is released");
    }

    #[tokio::test]
    async fn test_broadcast_local_counts_deliveries() {
        let registry = ConnectionRegistry::new(Uuid::new_v4());
        let rooms = RoomManager::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let (sa, mut rx_a) = session(&registry, user_a);
        let (sb, mut rx_b) = session(&registry, user_b);

        rooms.join("a_b", sa);
        rooms.join("a_b", sb);

        let outcome = rooms.broadcast_local("a_b", &push());
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.torn_down.is_empty());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        assert_eq!(rooms.broadcast_local("nobody_here", &push()).delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dead_members() {
        let registry = ConnectionRegistry::new(Uuid::new_v4());
        let rooms = RoomManager::new();
        let (session, rx) = session(&registry, Uuid::new_v4());
        rooms.join("a_b", session.clone());
        drop(rx);

        let outcome = rooms.broadcast_local("a_b", &push());
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.torn_down, vec![session.session_id]);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_pair_room_id_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_room_id(a, b), pair_room_id(b, a));
    }

    #[test]
    fn test_peer_in_pair_room() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = pair_room_id(a, b);

        assert_eq!(peer_in_pair_room(&room, a), Some(b));
        assert_eq!(peer_in_pair_room(&room, b), Some(a));
        assert_eq!(peer_in_pair_room(&room, Uuid::new_v4()), None);
        assert_eq!(peer_in_pair_room("not-a-pair", a), None);
    }
}
