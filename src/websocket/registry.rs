use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::PushMessage;

/// Outbound channel handle for one session. Bounded: a session that cannot
/// keep up must not stall fanout for anyone else.
pub type SessionSender = mpsc::Sender<PushMessage>;

#[derive(Debug)]
pub enum SessionPushError {
    /// Buffer full past capacity: the consumer is too slow and the session
    /// gets torn down rather than retried.
    SlowConsumer,
    /// Receiver side already dropped (abrupt disconnect).
    Closed,
}

/// One live bidirectional connection. Owned by the registry of the instance
/// that accepted it; the entry is removable without the transport confirming
/// closure, so abrupt disconnects cannot leak sessions.
#[derive(Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub instance_id: Uuid,
    pub connected_at: DateTime<Utc>,
    sender: SessionSender,
}

impl Session {
    /// Non-blocking push into the session's outbound buffer. The transport
    /// write itself happens in the session's own task.
    pub fn try_push(&self, msg: PushMessage) -> Result<(), SessionPushError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionPushError::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => SessionPushError::Closed,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Tracks live sessions per user on this instance.
///
/// The map shards by user-id hash, so unrelated users' registrations never
/// contend on one lock. In-memory only; this is not the durability boundary.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<Uuid, Vec<Session>>>,
    // session_id -> user_id, so unregister needs no user hint
    index: Arc<DashMap<Uuid, Uuid>>,
    instance_id: Uuid,
}

impl ConnectionRegistry {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            index: Arc::new(DashMap::new()),
            instance_id,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Add a session for `user_id`. Returns the session plus whether this
    /// user just transitioned from locally-offline to online — the caller
    /// uses that to trigger a backlog drain (the drain itself lives in the
    /// delivery router, not here).
    pub fn register(&self, user_id: Uuid, sender: SessionSender) -> (Session, bool) {
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id,
            instance_id: self.instance_id,
            connected_at: Utc::now(),
            sender,
        };

        let mut entry = self.sessions.entry(user_id).or_default();
        let was_offline = entry.is_empty();
        entry.push(session.clone());
        drop(entry);

        self.index.insert(session.session_id, user_id);
        (session, was_offline)
    }

    /// Idempotent removal; duplicate disconnect signals are expected and
    /// must not error.
    pub fn unregister(&self, session_id: Uuid) {
        let Some((_, user_id)) = self.index.remove(&session_id) else {
            return;
        };
        if let Some(mut entry) = self.sessions.get_mut(&user_id) {
            entry.retain(|s| s.session_id != session_id);
        }
        self.sessions.remove_if(&user_id, |_, list| list.is_empty());
    }

    /// Point-in-time snapshot of the user's live local sessions, safe to
    /// iterate while registrations and removals race.
    pub fn sessions_for(&self, user_id: Uuid) -> Vec<Session> {
        self.sessions
            .get(&user_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn is_online_locally(&self, user_id: Uuid) -> bool {
        self.sessions
            .get(&user_id)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    /// Push to every live session of a user. Sessions whose buffer is full
    /// are torn down as slow consumers; closed ones are swept. Returns how
    /// many sessions accepted the push.
    pub fn deliver_to_user(&self, user_id: Uuid, msg: &PushMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for session in self.sessions_for(user_id) {
            match session.try_push(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(SessionPushError::SlowConsumer) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        user_id = %user_id,
                        "session buffer full, dropping slow consumer"
                    );
                    crate::metrics::SLOW_CONSUMER_DISCONNECTS_TOTAL.inc();
                    dead.push(session.session_id);
                }
                Err(SessionPushError::Closed) => dead.push(session.session_id),
            }
        }
        for session_id in dead {
            self.unregister(session_id);
        }
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.index.len()
    }
}
