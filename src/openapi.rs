/// OpenAPI documentation for Nova Fanout Service
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Nova Fanout Service API",
        version = "1.0.0",
        description = "Presence-aware real-time notification and messaging fanout",
        contact(
            name = "Nova Team",
            email = "support@nova.app"
        ),
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Development server"),
        (url = "https://api.nova.app/fanout", description = "Production server"),
    ),
    paths(
        crate::routes::events::submit_event,
        crate::routes::events::get_delivery_state,
    ),
    components(schemas(
        crate::models::Event,
        crate::models::EventType,
        crate::models::PushMessage,
        crate::routes::events::SubmitEventPayload,
        crate::routes::events::DeliveryStatusResponse,
        crate::middleware::error_handling::ErrorResponse,
    )),
    tags(
        (name = "Health", description = "Service health checks"),
        (name = "Events", description = "Event submission and delivery state"),
        (name = "WebSocket", description = "Real-time sessions via WebSocket"),
    )
)]
pub struct ApiDoc;
