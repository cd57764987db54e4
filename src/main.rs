use fanout_service::{
    broker::{BrokerBridge, RedisBroker},
    config, db,
    delivery::{DeliveryRouter, RouterConfig},
    error, logging, metrics,
    middleware::auth,
    migrations, routes,
    services::PgOfflineStore,
    state::AppState,
    websocket::{ConnectionRegistry, RoomManager},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    // Initialize DB pool
    let db = db::init_pool(&cfg.database_url, cfg.database_max_connections)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    // Run embedded migrations (idempotent)
    migrations::run_all(&db)
        .await
        .map_err(|e| error::AppError::StartServer(format!("database migrations failed: {e}")))?;

    // Initialize JWT validation
    match cfg.jwt_public_key_pem.as_deref() {
        Some(pem) => auth::initialize_validation(pem)?,
        None => tracing::warn!(
            "JWT public key not configured; only WS_DEV_ALLOW_ALL connections will authenticate"
        ),
    }

    let instance_id = Uuid::new_v4();
    let registry = ConnectionRegistry::new(instance_id);
    let rooms = RoomManager::new();

    let broker = RedisBroker::connect(&cfg.redis_url).await?;
    // Keep the pub/sub listener running for the life of the process
    let _pubsub_listener = broker.clone().spawn_listener();
    let broker: Arc<dyn BrokerBridge> = broker;

    let store = Arc::new(PgOfflineStore::new(db.clone()));

    let router = DeliveryRouter::new(
        registry.clone(),
        rooms.clone(),
        broker,
        store,
        RouterConfig::from(&*cfg),
    );
    let _broker_listener = router.spawn_broker_listener();
    let _maintenance = router.spawn_maintenance();

    metrics::spawn_metrics_updater(registry.clone());

    let state = AppState {
        registry,
        rooms,
        router,
        config: cfg.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::build_router()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, %instance_id, "starting fanout-service");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    Ok(())
}
