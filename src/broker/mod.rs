use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AppError;
use crate::models::Event;

pub mod memory;
pub mod redis;

pub use memory::InMemoryBroker;
pub use redis::RedisBroker;

/// The shared fanout channel every instance publishes to and observes.
///
/// Fire-and-forget: `publish` returns once the event is handed to the
/// broker, not once any instance has delivered. Subscribers see every event
/// at least once — including the publisher's own — and must consume
/// idempotently by `event_id`.
#[async_trait]
pub trait BrokerBridge: Send + Sync {
    /// Publish one event to the shared channel. Succeeds or fails atomically
    /// from the caller's perspective; transport failure surfaces as
    /// `AppError::BrokerUnavailable` after bounded retry inside the adapter.
    async fn publish(&self, event: &Event) -> Result<(), AppError>;

    /// Every event observed on the shared channel, one receiver per caller.
    /// No total order across publishers; events from one publisher arrive in
    /// publish order.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
