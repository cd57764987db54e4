use crate::error::AppError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use uuid::Uuid;

static JWT_DECODING_KEY: OnceCell<DecodingKey> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String, // subject - typically the user_id
    pub exp: i64,    // expiration time (unix timestamp)
}

/// Install the RS256 validation key once at startup. Calling twice is a
/// startup bug, not a runtime condition.
pub fn initialize_validation(public_key_pem: &str) -> Result<(), AppError> {
    let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
        .map_err(|e| AppError::Config(format!("invalid JWT public key: {e}")))?;
    JWT_DECODING_KEY
        .set(key)
        .map_err(|_| AppError::Config("JWT validation initialized twice".into()))
}

/// Validate JWT signature and extract claims (RS256 only, no insecure fallbacks)
pub async fn verify_jwt(token: &str) -> Result<Claims, AppError> {
    let key = JWT_DECODING_KEY.get().ok_or(AppError::Unauthorized)?;
    let validation = Validation::new(Algorithm::RS256);
    match decode::<Claims>(token, key, &validation) {
        Ok(token_data) => Ok(token_data.claims),
        Err(_) => Err(AppError::Unauthorized),
    }
}

/// Middleware to extract JWT and add user_id to extensions
pub async fn auth_middleware(
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, AppError> {
    // Allow unauthenticated access to introspection endpoints; the websocket
    // route authenticates on its own (token travels as a query param).
    let path = req.uri().path();
    if matches!(
        path,
        "/health" | "/metrics" | "/openapi.json" | "/swagger-ui" | "/docs" | "/ws"
    ) {
        return Ok(next.run(req).await);
    }

    // Extract Authorization header
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    // Parse Bearer token
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized)?;

    // Verify JWT and extract claims
    let claims = verify_jwt(token).await?;

    // Parse user_id from claims.sub (should be a UUID)
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::BadRequest("Invalid user_id in token".into()))?;

    // Add user_id to request extensions
    req.extensions_mut().insert(user_id);

    Ok(next.run(req).await)
}
