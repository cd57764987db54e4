use crate::state::AppState;
use axum::middleware;
use axum::{
    routing::{get, post},
    Json, Router,
};

pub mod events;
use events::{get_delivery_state, submit_event};

use crate::websocket::handlers::ws_handler;

// OpenAPI endpoint handler
async fn openapi_json() -> Json<serde_json::Value> {
    use utoipa::OpenApi;
    Json(serde_json::to_value(crate::openapi::ApiDoc::openapi()).unwrap_or_default())
}

// Swagger UI handler
async fn swagger_ui() -> axum::response::Html<&'static str> {
    axum::response::Html(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Nova Fanout Service API</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            SwaggerUIBundle({
                url: "/openapi.json",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                plugins: [
                    SwaggerUIBundle.plugins.DownloadUrl
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>"#,
    )
}

pub fn build_router() -> Router<AppState> {
    // Service introspection endpoints (no API version prefix)
    let introspection = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route("/swagger-ui", get(swagger_ui));

    // API v1 endpoints (collaborator-facing, bearer-authenticated)
    let api_v1 = Router::new()
        .route("/events", post(submit_event))
        .route("/events/:event_id/delivery", get(get_delivery_state));

    Router::new()
        .merge(introspection)
        .nest("/api/v1", api_v1)
        // Persistent sessions; authenticates on its own during the upgrade
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(
            crate::middleware::auth::auth_middleware,
        ))
        .layer(middleware::from_fn(crate::metrics::track_http_metrics))
}
