use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

use crate::websocket::registry::ConnectionRegistry;

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "fanout_service_http_requests_total",
            "Total HTTP requests handled by fanout-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create fanout_service_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "fanout_service_http_request_duration_seconds",
            "HTTP request latencies for fanout-service",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ]),
        &["method", "path", "status"],
    )
    .expect("failed to create fanout_service_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register fanout_service_http_request_duration_seconds");
    histogram
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "fanout_service_active_sessions",
        "Live websocket sessions on this instance",
    )
    .expect("failed to create fanout_service_active_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register fanout_service_active_sessions");
    gauge
});

pub static EVENTS_SUBMITTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "fanout_service_events_submitted_total",
            "Events originated on this instance, by type",
        ),
        &["type"],
    )
    .expect("failed to create fanout_service_events_submitted_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_events_submitted_total");
    counter
});

pub static EVENTS_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_events_delivered_total",
        "Session deliveries performed on this instance",
    )
    .expect("failed to create fanout_service_events_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_events_delivered_total");
    counter
});

pub static EVENTS_STORED_OFFLINE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_events_stored_offline_total",
        "Events written to the durable fallback",
    )
    .expect("failed to create fanout_service_events_stored_offline_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_events_stored_offline_total");
    counter
});

pub static BROKER_PUBLISH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_broker_publish_failures_total",
        "Publishes that failed after adapter-side retries",
    )
    .expect("failed to create fanout_service_broker_publish_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_broker_publish_failures_total");
    counter
});

pub static STORE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_store_failures_total",
        "Durable fallback writes that failed; each one is a lost durability guarantee",
    )
    .expect("failed to create fanout_service_store_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_store_failures_total");
    counter
});

pub static SLOW_CONSUMER_DISCONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_slow_consumer_disconnects_total",
        "Sessions torn down because their outbound buffer or write stalled",
    )
    .expect("failed to create fanout_service_slow_consumer_disconnects_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_slow_consumer_disconnects_total");
    counter
});

pub static BACKLOG_DRAINED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_service_backlog_drained_total",
        "Offline notifications delivered on reconnect",
    )
    .expect("failed to create fanout_service_backlog_drained_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register fanout_service_backlog_drained_total");
    counter
});

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let start = Instant::now();

    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path, &status])
        .observe(start.elapsed().as_secs_f64());

    response
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(buffer.into())
        .unwrap_or_else(|err| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(err.to_string().into())
                .expect("failed to build metrics error response")
        })
}

/// Sample the registry into the session gauge on a fixed cadence.
pub fn spawn_metrics_updater(registry: ConnectionRegistry) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            ACTIVE_SESSIONS.set(registry.session_count() as i64);
        }
    });
}
