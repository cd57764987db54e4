use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics;
use crate::middleware::auth::verify_jwt;
use crate::models::{Event, EventType};
use crate::state::AppState;
use crate::websocket::message_types::{connected_frame, error_frame, WsInboundEvent};
use crate::websocket::registry::Session;
use crate::websocket::rooms;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    pub user_id: Option<Uuid>,
}

async fn authenticate(
    params: &WsParams,
    headers: &HeaderMap,
) -> Result<Uuid, axum::http::StatusCode> {
    let dev_allow = std::env::var("WS_DEV_ALLOW_ALL").unwrap_or_else(|_| "false".into()) == "true";

    if dev_allow {
        if let Some(user_id) = params.user_id {
            warn!("JWT validation BYPASSED (WS_DEV_ALLOW_ALL=true) - DO NOT USE IN PRODUCTION");
            return Ok(user_id);
        }
    }

    let token = params.token.clone().or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string())
    });

    match token {
        None => {
            error!("WebSocket connection rejected: no bearer token provided");
            Err(axum::http::StatusCode::UNAUTHORIZED)
        }
        Some(t) => {
            let claims = verify_jwt(&t).await.map_err(|e| {
                error!("WebSocket connection rejected: invalid token: {e}");
                axum::http::StatusCode::UNAUTHORIZED
            })?;
            Uuid::parse_str(&claims.sub).map_err(|_| {
                error!("WebSocket connection rejected: token subject is not a user id");
                axum::http::StatusCode::UNAUTHORIZED
            })
        }
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Connections without a valid credential are refused before upgrade
    let user_id = match authenticate(&params, &headers).await {
        Ok(user_id) => user_id,
        Err(status) => return status.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(state, user_id, socket))
        .into_response()
}

async fn handle_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel(state.config.session_send_buffer);
    let (session, was_offline) = state.registry.register(user_id, tx);
    info!(
        user_id = %user_id,
        session_id = %session.session_id,
        "session registered"
    );

    if sender
        .send(Message::Text(connected_frame(&session)))
        .await
        .is_err()
    {
        state.registry.unregister(session.session_id);
        return;
    }

    // Drain AFTER registration: anything arriving between the fetch and now
    // lands in the session's push channel instead of being lost.
    if was_offline {
        if let Err(e) = state.router.drain_backlog(user_id, &session).await {
            error!(user_id = %user_id, error = %e, "backlog drain failed");
        }
    }

    let write_timeout = Duration::from_millis(state.config.session_write_timeout_ms);
    let mut joined_rooms: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            // Outbound: pushes queued by the registry / room manager
            maybe = rx.recv() => {
                let Some(push) = maybe else { break };
                let Ok(text) = push.to_json() else {
                    error!(event_id = %push.event_id, "failed to serialize outbound push");
                    continue;
                };
                match tokio::time::timeout(write_timeout, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        // A write stalled past the timeout: this consumer is
                        // too slow to keep in the fanout path.
                        warn!(
                            session_id = %session.session_id,
                            "transport write timed out, dropping slow session"
                        );
                        metrics::SLOW_CONSUMER_DISCONNECTS_TOTAL.inc();
                        break;
                    }
                }
            }

            // Inbound: client operations
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsInboundEvent>(&text) {
                            Ok(evt) => {
                                if let Err(e) = handle_ws_event(evt, &state, &session, &mut joined_rooms).await {
                                    let frame = ws_error_frame(&e);
                                    if sender.send(Message::Text(frame)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(_) => {
                                let frame = error_frame("INVALID_EVENT", "unrecognized inbound event");
                                if sender.send(Message::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the framework
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // A disconnecting session cancels only its own pending writes; room
    // peers and the user's other devices are untouched.
    for room_id in joined_rooms {
        state.rooms.leave(&room_id, session.session_id);
    }
    state.registry.unregister(session.session_id);
    info!(session_id = %session.session_id, "session closed");
}

async fn handle_ws_event(
    evt: WsInboundEvent,
    state: &AppState,
    session: &Session,
    joined_rooms: &mut HashSet<String>,
) -> Result<(), AppError> {
    match evt {
        WsInboundEvent::JoinRoom { room_id } => {
            state.rooms.join(&room_id, session.clone());
            joined_rooms.insert(room_id);
            Ok(())
        }
        WsInboundEvent::LeaveRoom { room_id } => {
            state.rooms.leave(&room_id, session.session_id);
            joined_rooms.remove(&room_id);
            Ok(())
        }
        WsInboundEvent::Send {
            room_id,
            recipient_user_id,
            payload,
        } => {
            let event = match (room_id, recipient_user_id) {
                (Some(room_id), None) => {
                    // In a pair room the durable fallback belongs to the
                    // other member; non-pair rooms have no single recipient.
                    let peer = rooms::peer_in_pair_room(&room_id, session.user_id);
                    Event::to_room(room_id, peer, Some(session.user_id), payload)
                }
                (None, Some(recipient)) => Event::to_user(
                    EventType::Message,
                    recipient,
                    Some(session.user_id),
                    payload,
                ),
                _ => {
                    return Err(AppError::BadRequest(
                        "send requires exactly one of room_id or recipient_user_id".into(),
                    ))
                }
            };
            state.router.dispatch(event).await.map(|_| ())
        }
    }
}

/// BrokerUnavailable is recovered inside the router and never reaches the
/// sender; everything else maps to an error frame on this session only.
fn ws_error_frame(err: &AppError) -> String {
    let code = match err {
        AppError::BadRequest(_) => "INVALID_REQUEST",
        AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        _ => "INTERNAL_ERROR",
    };
    error_frame(code, &err.to_string())
}
