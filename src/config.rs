use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub port: u16,
    /// RS256 public key for validating bearer tokens. Absent only when the
    /// deployment relies on the dev bypass (`WS_DEV_ALLOW_ALL`).
    pub jwt_public_key_pem: Option<String>,
    /// TTL for the locally-observed event-id dedup set, in seconds.
    pub dedup_ttl_secs: u64,
    /// TTL for the per-instance delivery log backing the delivery query.
    pub delivery_log_ttl_secs: u64,
    /// Capacity of each session's outbound buffer; a full buffer marks the
    /// session a slow consumer and forces unregistration.
    pub session_send_buffer: usize,
    /// Upper bound on a single transport write before the session is torn down.
    pub session_write_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        // Public key can arrive inline or as a file path
        let jwt_public_key_pem = match env::var("JWT_PUBLIC_KEY_PEM") {
            Ok(pem) if !pem.trim().is_empty() => Some(pem),
            _ => match env::var("JWT_PUBLIC_KEY_FILE") {
                Ok(path) if !path.trim().is_empty() => Some(
                    std::fs::read_to_string(&path).map_err(|e| {
                        crate::error::AppError::Config(format!("read jwt pubkey file: {e}"))
                    })?,
                ),
                _ => None,
            },
        };

        let dedup_ttl_secs = env::var("EVENT_DEDUP_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);
        let delivery_log_ttl_secs = env::var("DELIVERY_LOG_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);
        let session_send_buffer = env::var("SESSION_SEND_BUFFER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256);
        let session_write_timeout_ms = env::var("SESSION_WRITE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        Ok(Self {
            database_url,
            database_max_connections,
            redis_url,
            port,
            jwt_public_key_pem,
            dedup_ttl_secs,
            delivery_log_ttl_secs,
            session_send_buffer,
            session_write_timeout_ms,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            database_max_connections: 5,
            redis_url: "redis://127.0.0.1:6379/0".into(),
            port: 3000,
            jwt_public_key_pem: None,
            dedup_ttl_secs: 120,
            delivery_log_ttl_secs: 600,
            session_send_buffer: 256,
            session_write_timeout_ms: 5000,
        }
    }
}
