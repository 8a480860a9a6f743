// ABOUTME: Shared-secret API key middleware with constant-time comparison
// ABOUTME: Missing key is 401, wrong key is 403; an empty configured key disables auth

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::Config;
use crate::error::AppError;

/// Paths that never require authentication.
const EXEMPT_PATHS: &[&str] = &["/health"];

pub async fn api_key_middleware(
    State(config): State<Arc<Config>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Empty configured key = unauthenticated mode, warned about at startup.
    if config.api_key.is_empty() {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path();
    if EXEMPT_PATHS.contains(&path) {
        return Ok(next.run(request).await);
    }

    let provided = match extract_api_key(request.headers(), &config.api_key_header_name) {
        Some(provided) => provided,
        None => {
            warn!(%path, "request without API key");
            return Err(AppError::Unauthenticated);
        }
    };

    if !bool::from(provided.as_bytes().ct_eq(config.api_key.as_bytes())) {
        warn!(%path, "request with invalid API key");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}

/// The configured header first, then `Authorization: Bearer <key>`.
fn extract_api_key(headers: &HeaderMap, header_name: &str) -> Option<String> {
    if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}
