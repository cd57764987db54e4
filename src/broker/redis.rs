use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::BrokerBridge;
use crate::error::AppError;
use crate::models::Event;
use crate::services::backoff::retry_with_backoff;

/// All instances share one pub/sub channel; each instance filters against
/// its own registry.
pub const FANOUT_CHANNEL: &str = "fanout:events";

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BASE_DELAY: Duration = Duration::from_millis(50);

/// Capacity of the local fan-in channel between the pub/sub listener and
/// router subscribers. Subscribers that lag skip events (RecvError::Lagged).
const SUBSCRIBER_CAPACITY: usize = 4096;

/// Redis pub/sub implementation of the broker bridge.
///
/// Publishes go through a shared `ConnectionManager`; the subscription runs
/// on a dedicated connection (pub/sub cannot share the multiplexed one) and
/// forwards every observed event into a local broadcast channel.
pub struct RedisBroker {
    client: Client,
    publish_conn: ConnectionManager,
    local: broadcast::Sender<Event>,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Arc<Self>, AppError> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::StartServer(format!("redis client: {e}")))?;
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AppError::StartServer(format!("redis connection manager: {e}")))?;
        let (local, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        Ok(Arc::new(Self {
            client,
            publish_conn,
            local,
        }))
    }

    /// Run the pub/sub listener until process exit, reconnecting with a
    /// short pause whenever the subscription drops.
    pub fn spawn_listener(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listen_once().await {
                    Ok(()) => tracing::warn!("fanout pub/sub stream ended, reconnecting"),
                    Err(e) => {
                        tracing::warn!(error = %e, "fanout pub/sub listener failed, reconnecting")
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
    }

    async fn listen_once(&self) -> redis::RedisResult<()> {
        // PubSub requires a dedicated connection, not multiplexed
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(FANOUT_CHANNEL).await?;
        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let payload: String = msg.get_payload()?;
            match serde_json::from_str::<Event>(&payload) {
                Ok(event) => {
                    // send() errs only when nobody subscribed yet; that's fine
                    let _ = self.local.send(event);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed fanout payload");
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerBridge for RedisBroker {
    async fn publish(&self, event: &Event) -> Result<(), AppError> {
        let payload =
            serde_json::to_string(event).map_err(|e| AppError::Serialization(e.to_string()))?;

        retry_with_backoff(
            PUBLISH_ATTEMPTS,
            PUBLISH_BASE_DELAY,
            |_: &redis::RedisError| true,
            || {
                let mut conn = self.publish_conn.clone();
                let payload = payload.clone();
                async move { conn.publish::<_, _, ()>(FANOUT_CHANNEL, payload).await }
            },
        )
        .await
        .map_err(|e| AppError::BrokerUnavailable(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.local.subscribe()
    }
}
