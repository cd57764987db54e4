use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::guards::User,
    models::{Event, EventType},
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitEventPayload {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub recipient_user_id: Uuid,
    pub sender_user_id: Option<Uuid>,
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeliveryStatusResponse {
    pub event_id: Uuid,
    pub delivered: bool,
    pub local_deliveries: u64,
    pub stored_offline: bool,
}

/// POST /api/v1/events
/// Submit an event for fanout. The server stamps `event_id` and
/// `created_at`; delivery proceeds regardless of whether the recipient is
/// currently online (offline recipients get a durable copy).
#[utoipa::path(
    post,
    path = "/api/v1/events",
    request_body = SubmitEventPayload,
    responses(
        (status = 202, description = "Event accepted for fanout", body = Event),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 503, description = "Durable fallback unavailable"),
    ),
    tag = "Events"
)]
pub async fn submit_event(
    State(state): State<AppState>,
    _user: User,
    Json(body): Json<SubmitEventPayload>,
) -> Result<(StatusCode, Json<Event>), AppError> {
    let event = Event::to_user(
        body.event_type,
        body.recipient_user_id,
        body.sender_user_id,
        body.payload,
    );

    let outcome = state.router.dispatch(event).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome.event)))
}

/// GET /api/v1/events/{event_id}/delivery
/// Side-channel for analytics/observability tooling: what this instance
/// observed for an event. Answers only within the delivery-log TTL.
#[utoipa::path(
    get,
    path = "/api/v1/events/{event_id}/delivery",
    params(
        ("event_id" = Uuid, Path, description = "Event to look up"),
    ),
    responses(
        (status = 200, description = "Delivery state", body = DeliveryStatusResponse),
        (status = 404, description = "Unknown event or log window expired"),
    ),
    tag = "Events"
)]
pub async fn get_delivery_state(
    State(state): State<AppState>,
    _user: User,
    Path(event_id): Path<Uuid>,
) -> Result<Json<DeliveryStatusResponse>, AppError> {
    let record = state
        .router
        .delivery_state(event_id)
        .ok_or(AppError::NotFound)?;

    Ok(Json(DeliveryStatusResponse {
        event_id,
        delivered: record.delivered(),
        local_deliveries: record.local_deliveries,
        stored_offline: record.stored_offline,
    }))
}
