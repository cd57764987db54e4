use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::OfflineNotification;
use crate::services::backoff::retry_with_backoff;

/// Maximum retry attempts for transient store failures
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// The durable fallback for recipients with no live session fleet-wide.
///
/// The core depends only on this interface; the concrete store is an
/// external collaborator. Rows are never deleted here — retention is the
/// collaborator's policy.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Persist an undelivered event for its recipient. Storing the same
    /// `(event_id, recipient)` twice is a no-op, matching at-least-once
    /// dispatch upstream.
    async fn store(&self, notification: OfflineNotification) -> Result<(), AppError>;

    /// Undelivered events for a user, ordered by `created_at` ascending.
    async fn fetch_undelivered(&self, user_id: Uuid) -> Result<Vec<OfflineNotification>, AppError>;

    /// Flip one row to delivered. Already-delivered rows stay untouched.
    async fn mark_delivered(&self, event_id: Uuid, user_id: Uuid) -> Result<(), AppError>;
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

/// PostgreSQL-backed offline store.
///
/// Transient pool/io failures are retried here with bounded backoff; what
/// still fails after that surfaces as `StoreUnavailable`, which callers
/// treat as fatal for the event's durability guarantee.
pub struct PgOfflineStore {
    db: PgPool,
}

impl PgOfflineStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OfflineStore for PgOfflineStore {
    async fn store(&self, notification: OfflineNotification) -> Result<(), AppError> {
        retry_with_backoff(MAX_RETRIES, RETRY_BASE_DELAY, is_transient, || {
            let note = notification.clone();
            let db = self.db.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO offline_notifications
                        (event_id, recipient_user_id, event_type, sender_user_id,
                         room_id, payload, created_at, delivered)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
                    ON CONFLICT (event_id, recipient_user_id) DO NOTHING
                    "#,
                )
                .bind(note.event_id)
                .bind(note.recipient_user_id)
                .bind(note.event_type.as_str())
                .bind(note.sender_user_id)
                .bind(note.room_id)
                .bind(note.payload)
                .bind(note.created_at)
                .execute(&db)
                .await
                .map(|_| ())
            }
        })
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn fetch_undelivered(&self, user_id: Uuid) -> Result<Vec<OfflineNotification>, AppError> {
        retry_with_backoff(MAX_RETRIES, RETRY_BASE_DELAY, is_transient, || {
            let db = self.db.clone();
            async move {
                sqlx::query_as::<_, OfflineNotification>(
                    r#"
                    SELECT event_id, recipient_user_id, event_type, sender_user_id,
                           room_id, payload, created_at, delivered, delivered_at
                    FROM offline_notifications
                    WHERE recipient_user_id = $1 AND delivered = FALSE
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(user_id)
                .fetch_all(&db)
                .await
            }
        })
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn mark_delivered(&self, event_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        retry_with_backoff(MAX_RETRIES, RETRY_BASE_DELAY, is_transient, || {
            let db = self.db.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE offline_notifications
                    SET delivered = TRUE, delivered_at = NOW()
                    WHERE event_id = $1 AND recipient_user_id = $2 AND delivered = FALSE
                    "#,
                )
                .bind(event_id)
                .bind(user_id)
                .execute(&db)
                .await
                .map(|_| ())
            }
        })
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }
}

/// In-memory store. Backs the integration tests and local development
/// without a database, the same way the registry backs sessions.
pub struct InMemoryOfflineStore {
    rows: Mutex<Vec<OfflineNotification>>,
    available: AtomicBool,
}

impl Default for InMemoryOfflineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::StoreUnavailable("simulated outage".into()))
        }
    }

    /// All rows, delivered or not. Test introspection only.
    pub fn snapshot(&self) -> Vec<OfflineNotification> {
        self.rows.lock().expect("offline store lock poisoned").clone()
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn store(&self, notification: OfflineNotification) -> Result<(), AppError> {
        self.check_available()?;
        let mut rows = self.rows.lock().expect("offline store lock poisoned");
        let exists = rows.iter().any(|r| {
            r.event_id == notification.event_id
                && r.recipient_user_id == notification.recipient_user_id
        });
        if !exists {
            rows.push(notification);
        }
        Ok(())
    }

    async fn fetch_undelivered(&self, user_id: Uuid) -> Result<Vec<OfflineNotification>, AppError> {
        self.check_available()?;
        let rows = self.rows.lock().expect("offline store lock poisoned");
        let mut pending: Vec<OfflineNotification> = rows
            .iter()
            .filter(|r| r.recipient_user_id == user_id && !r.delivered)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn mark_delivered(&self, event_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        self.check_available()?;
        let mut rows = self.rows.lock().expect("offline store lock poisoned");
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.event_id == event_id && r.recipient_user_id == user_id && !r.delivered)
        {
            row.delivered = true;
            row.delivered_at = Some(chrono::Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventType};
    use serde_json::json;

    #[tokio::test]
    async fn test_store_is_idempotent_per_event_and_recipient() {
        let store = InMemoryOfflineStore::new();
        let recipient = Uuid::new_v4();
        let event = Event::to_user(EventType::Follow, recipient, None, json!({}));
        let note = OfflineNotification::from_event(&event, recipient);

        store.store(note.clone()).await.unwrap();
        store.store(note).await.unwrap();

        assert_eq!(store.fetch_undelivered(recipient).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_created_at() {
        let store = InMemoryOfflineStore::new();
        let recipient = Uuid::new_v4();

        let mut first = OfflineNotification::from_event(
            &Event::to_user(EventType::Like, recipient, None, json!({"n": 1})),
            recipient,
        );
        let mut second = OfflineNotification::from_event(
            &Event::to_user(EventType::Like, recipient, None, json!({"n": 2})),
            recipient,
        );
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        second.created_at = chrono::Utc::now();

        // insert newest first to prove ordering comes from the store
        store.store(second.clone()).await.unwrap();
        store.store(first.clone()).await.unwrap();

        let pending = store.fetch_undelivered(recipient).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event_id, first.event_id);
        assert_eq!(pending[1].event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_mark_delivered_removes_from_backlog_but_keeps_the_row() {
        let store = InMemoryOfflineStore::new();
        let recipient = Uuid::new_v4();
        let event = Event::to_user(EventType::Comment, recipient, None, json!({}));
        store
            .store(OfflineNotification::from_event(&event, recipient))
            .await
            .unwrap();

        store.mark_delivered(event.event_id, recipient).await.unwrap();

        assert!(store.fetch_undelivered(recipient).await.unwrap().is_empty());
        let all = store.snapshot();
        assert_eq!(all.len(), 1, "delivered rows are kept, never deleted");
        assert!(all[0].delivered);
        assert!(all[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_unavailable() {
        let store = InMemoryOfflineStore::new();
        store.set_available(false);
        let recipient = Uuid::new_v4();
        let event = Event::to_user(EventType::Like, recipient, None, json!({}));

        let err = store
            .store(OfflineNotification::from_event(&event, recipient))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }
}
