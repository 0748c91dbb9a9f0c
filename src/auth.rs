use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{app::AppState, error::ApiError};

/// Rejects requests without the configured bearer token. A no-op when no token is set.
pub async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.config.api_key.as_deref()
        && !is_authorized(req.headers(), expected)
    {
        warn!("Rejected unauthenticated request to {}", req.uri().path());
        return ApiError::unauthorized().into_response();
    }

    next.run(req).await
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| tokens_match(token, expected))
}

// Compares digests so the match time does not depend on where the tokens diverge.
fn tokens_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}
