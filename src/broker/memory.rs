use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::broker::BrokerBridge;
use crate::error::AppError;
use crate::models::Event;

/// In-process broker over a tokio broadcast channel.
///
/// Several routers subscribing to one `InMemoryBroker` behave like a fleet
/// of instances sharing a fanout channel, which is how the integration
/// tests exercise cross-instance delivery. `set_available(false)` simulates
/// a broker outage.
pub struct InMemoryBroker {
    sender: broadcast::Sender<Event>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BrokerBridge for InMemoryBroker {
    async fn publish(&self, event: &Event) -> Result<(), AppError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AppError::BrokerUnavailable("simulated outage".into()));
        }
        // send() errs only when nobody subscribed; fanout to zero instances
        // is still a successful publish
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broker = InMemoryBroker::new();
        let mut rx1 = broker.subscribe();
        let mut rx2 = broker.subscribe();

        let event = Event::to_user(EventType::Like, Uuid::new_v4(), None, json!({}));
        broker.publish(&event).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().event_id, event.event_id);
        assert_eq!(rx2.recv().await.unwrap().event_id, event.event_id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = InMemoryBroker::new();
        let event = Event::to_user(EventType::Like, Uuid::new_v4(), None, json!({}));
        assert!(broker.publish(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_outage_surfaces_broker_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let event = Event::to_user(EventType::Like, Uuid::new_v4(), None, json!({}));
        let err = broker.publish(&event).await.unwrap_err();
        assert!(matches!(err, AppError::BrokerUnavailable(_)));

        broker.set_available(true);
        assert!(broker.publish(&event).await.is_ok());
    }
}
