use crate::middleware::error_handling;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_handling::into_response(self).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// Broker publish failed. Recovered by routing straight to the durable
    /// fallback; never surfaced to the event sender.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Durable fallback failed. Fatal for that event's durability guarantee:
    /// an offline recipient would silently miss it, so this one IS surfaced.
    #[error("offline store unavailable: {0}")]
    StoreUnavailable(String),

    /// A session's write stalled past the timeout; the session is torn down,
    /// not retried.
    #[error("slow consumer, session torn down")]
    SlowConsumer,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Whether the failure is transient (retried at the adapter boundary,
    /// never by the router itself).
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => {
                matches!(
                    e,
                    sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
                )
            }
            AppError::BrokerUnavailable(_) => true,
            _ => false,
        }
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound => 404,
            AppError::BrokerUnavailable(_) => 502,
            AppError::StoreUnavailable(_) => 503,
            AppError::Database(_) | AppError::Internal => 500,
            _ => 500,
        }
    }
}
