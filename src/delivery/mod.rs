use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::BrokerBridge;
use crate::error::AppError;
use crate::metrics;
use crate::models::{Event, OfflineNotification, PushMessage};
use crate::services::OfflineStore;
use crate::websocket::registry::{ConnectionRegistry, Session};
use crate::websocket::rooms::RoomManager;

pub mod dedup;

use dedup::ExpiringEventSet;

/// What happened to one event on this instance. Feeds the delivery
/// side-channel query and the integration tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryRecord {
    pub local_deliveries: u64,
    pub stored_offline: bool,
}

impl DeliveryRecord {
    pub fn delivered(&self) -> bool {
        self.local_deliveries > 0
    }
}

/// Outcome of dispatching a freshly originated event.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub event: Event,
    pub local_deliveries: usize,
    pub stored_offline: bool,
}

pub struct RouterConfig {
    pub dedup_ttl: Duration,
    pub delivery_log_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(120),
            delivery_log_ttl: Duration::from_secs(600),
        }
    }
}

impl From<&crate::config::Config> for RouterConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            dedup_ttl: Duration::from_secs(cfg.dedup_ttl_secs),
            delivery_log_ttl: Duration::from_secs(cfg.delivery_log_ttl_secs),
        }
    }
}

/// The per-event orchestrator: local check, fleet publish, durable fallback,
/// backlog drain. Holds no locks across instances — consistency comes from
/// idempotent at-least-once delivery plus `event_id` dedup.
///
/// Per-event state machine:
/// `CREATED -> LOCAL_CHECKED -> PUBLISHED -> {DELIVERED | STORED_OFFLINE}`.
pub struct DeliveryRouter {
    registry: ConnectionRegistry,
    rooms: RoomManager,
    broker: Arc<dyn BrokerBridge>,
    store: Arc<dyn OfflineStore>,
    seen: ExpiringEventSet,
    log: DeliveryLog,
}

impl DeliveryRouter {
    pub fn new(
        registry: ConnectionRegistry,
        rooms: RoomManager,
        broker: Arc<dyn BrokerBridge>,
        store: Arc<dyn OfflineStore>,
        config: RouterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            rooms,
            broker,
            store,
            seen: ExpiringEventSet::new(config.dedup_ttl),
            log: DeliveryLog::new(config.delivery_log_ttl),
        })
    }

    /// Dispatch a freshly originated event.
    ///
    /// The event is published at most once per origination; our own broker
    /// echo is suppressed by recording the id in the seen set first. The
    /// durable fallback is taken proactively whenever the addressed
    /// recipient had zero local sessions — no instance can cheaply prove
    /// "offline everywhere", so a live remote delivery plus a queued copy is
    /// an accepted duplicate, dedup'd by the consumer via `event_id`.
    pub async fn dispatch(&self, event: Event) -> Result<DeliveryOutcome, AppError> {
        metrics::EVENTS_SUBMITTED_TOTAL
            .with_label_values(&[event.event_type.as_str()])
            .inc();

        // LOCAL_CHECKED; also guards against our own publish coming back
        self.seen.insert(event.event_id);
        let local_deliveries = self.deliver_local(&event);
        // Evaluated after delivery so sessions torn down mid-fanout count as
        // unreached and still get the durable copy.
        let recipient_reached_locally = self.recipient_reached_locally(&event, local_deliveries);
        if local_deliveries > 0 {
            self.log.record_deliveries(event.event_id, local_deliveries as u64);
            metrics::EVENTS_DELIVERED_TOTAL.inc_by(local_deliveries as u64);
        }

        // PUBLISHED; exactly once per event, other instances fan out from here
        let publish_failed = match self.broker.publish(&event).await {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    error = %e,
                    "broker publish failed, falling back to durable store"
                );
                metrics::BROKER_PUBLISH_FAILURES_TOTAL.inc();
                true
            }
        };

        // STORED_OFFLINE
        let mut stored_offline = false;
        if let Some(recipient) = event.recipient_user_id {
            if !recipient_reached_locally || publish_failed {
                match self
                    .store
                    .store(OfflineNotification::from_event(&event, recipient))
                    .await
                {
                    Ok(()) => {
                        stored_offline = true;
                        self.log.record_offline(event.event_id);
                        metrics::EVENTS_STORED_OFFLINE_TOTAL.inc();
                    }
                    Err(e) => {
                        // The durability guarantee for this event is gone;
                        // surface it instead of swallowing.
                        tracing::error!(
                            event_id = %event.event_id,
                            recipient_user_id = %recipient,
                            error = %e,
                            "offline store write failed, event durability lost"
                        );
                        metrics::STORE_FAILURES_TOTAL.inc();
                        return Err(e);
                    }
                }
            }
        }

        Ok(DeliveryOutcome {
            event,
            local_deliveries,
            stored_offline,
        })
    }

    /// Consume one event observed on the shared channel. Idempotent per
    /// `event_id`: broker redelivery and our own publish echo are dropped
    /// here. Public so tests can inject duplicate observations directly.
    pub async fn handle_observed(&self, event: Event) {
        if !self.seen.insert(event.event_id) {
            return;
        }
        let delivered = self.deliver_local(&event);
        if delivered > 0 {
            self.log.record_deliveries(event.event_id, delivered as u64);
            metrics::EVENTS_DELIVERED_TOTAL.inc_by(delivered as u64);
        }
    }

    /// Push to the sessions this instance holds for the event's target.
    fn deliver_local(&self, event: &Event) -> usize {
        let push = PushMessage::from(event);
        match &event.room_id {
            Some(room_id) => {
                let outcome = self.rooms.broadcast_local(room_id, &push);
                for session_id in outcome.torn_down {
                    self.registry.unregister(session_id);
                }
                outcome.delivered
            }
            None => match event.recipient_user_id {
                Some(recipient) => self.registry.deliver_to_user(recipient, &push),
                None => 0,
            },
        }
    }

    /// Whether the addressed recipient actually had a local session the
    /// delivery reached. Plain events count their deliveries directly; room
    /// events check the room's local materialization, since a recipient who
    /// never joined the room does not hear a room broadcast.
    fn recipient_reached_locally(&self, event: &Event, local_deliveries: usize) -> bool {
        let Some(recipient) = event.recipient_user_id else {
            return true;
        };
        match &event.room_id {
            Some(room_id) => self.rooms.local_users(room_id).contains(&recipient),
            None => local_deliveries > 0,
        }
    }

    /// Deliver the stored backlog to a session that just brought its user
    /// online, oldest first, marking each row delivered. Triggered by the
    /// registry's offline-to-online transition signal; the registry itself
    /// knows nothing about backlogs.
    pub async fn drain_backlog(&self, user_id: Uuid, session: &Session) -> Result<usize, AppError> {
        let pending = self.store.fetch_undelivered(user_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut drained = 0;
        for note in pending {
            if session.try_push(note.push_message()).is_err() {
                // Session gone or saturated mid-drain; the rest of the
                // backlog stays undelivered for the next connect.
                break;
            }
            self.store.mark_delivered(note.event_id, user_id).await?;
            self.log.record_deliveries(note.event_id, 1);
            drained += 1;
        }

        if drained > 0 {
            metrics::BACKLOG_DRAINED_TOTAL.inc_by(drained as u64);
            tracing::info!(user_id = %user_id, count = drained, "drained offline backlog");
        }
        Ok(drained)
    }

    /// Delivery side-channel: what this instance observed for an event.
    /// `None` once the log TTL has passed or if the event was never seen here.
    pub fn delivery_state(&self, event_id: Uuid) -> Option<DeliveryRecord> {
        self.log.get(event_id)
    }

    /// Forward broker observations into the router until the broker closes.
    pub fn spawn_broker_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut rx = router.broker.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => router.handle_observed(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "broker subscriber lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodic prune of the time-bounded sets.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                router.seen.prune();
                router.log.prune();
            }
        })
    }
}

/// TTL-bounded per-instance log answering "is this event delivered".
struct DeliveryLog {
    ttl: Duration,
    inner: DashMap<Uuid, (DeliveryRecord, Instant)>,
}

impl DeliveryLog {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: DashMap::new(),
        }
    }

    fn record_deliveries(&self, event_id: Uuid, count: u64) {
        let mut entry = self
            .inner
            .entry(event_id)
            .or_insert((DeliveryRecord::default(), Instant::now()));
        entry.0.local_deliveries += count;
        entry.1 = Instant::now();
    }

    fn record_offline(&self, event_id: Uuid) {
        let mut entry = self
            .inner
            .entry(event_id)
            .or_insert((DeliveryRecord::default(), Instant::now()));
        entry.0.stored_offline = true;
        entry.1 = Instant::now();
    }

    fn get(&self, event_id: Uuid) -> Option<DeliveryRecord> {
        self.inner.get(&event_id).and_then(|entry| {
            if entry.1.elapsed() < self.ttl {
                Some(entry.0)
            } else {
                None
            }
        })
    }

    fn prune(&self) {
        let ttl = self.ttl;
        self.inner.retain(|_, (_, touched)| touched.elapsed() < ttl);
    }
}
