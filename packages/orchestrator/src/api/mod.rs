// ABOUTME: Router assembly and the caller-identity extractor

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use skiff_sandbox::manager::Caller;

use crate::error::AppError;
use crate::middleware::{api_key_middleware, request_logging_middleware};
use crate::state::AppState;

pub mod health;
pub mod sandboxes;

/// Header naming the acting user. Absent means operator scope.
pub const USER_ID_HEADER: &str = "x-user-id";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/sandboxes",
            post(sandboxes::create_sandbox).get(sandboxes::list_sandboxes),
        )
        .route(
            "/sandboxes/{id}",
            get(sandboxes::get_sandbox).delete(sandboxes::destroy_sandbox),
        )
        .route("/sandboxes/{id}/exec", post(sandboxes::exec_command))
        .route("/sandboxes/{id}/heartbeat", post(sandboxes::heartbeat))
        .route("/sandboxes/{id}/complete", post(sandboxes::complete))
        .route("/sandboxes/{id}/error", post(sandboxes::report_error))
        .layer(axum::middleware::from_fn_with_state(
            state.config.clone(),
            api_key_middleware,
        ))
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .with_state(state)
}

/// Extracts the caller's identity from the user header.
pub struct CallerIdentity(pub Caller);

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = match parts.headers.get(USER_ID_HEADER) {
            Some(value) => {
                let user_id = value.to_str().map_err(|_| {
                    AppError::Validation("user id header must be valid ASCII".to_string())
                })?;
                Caller::user(user_id)
            }
            None => Caller::admin(),
        };
        Ok(Self(caller))
    }
}
