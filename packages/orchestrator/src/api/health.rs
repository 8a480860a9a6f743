// ABOUTME: Health probe for the orchestrator service

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sandboxes: usize,
    pub uptime_seconds: f64,
}

pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let active_sandboxes = state.manager.active_sandbox_count().await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_sandboxes,
        uptime_seconds: (state.started_at.elapsed().as_secs_f64() * 10.0).round() / 10.0,
    }))
}
