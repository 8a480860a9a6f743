// ABOUTME: Sandbox API handlers: create, list, get, exec, heartbeat, complete, error, destroy
// ABOUTME: Validation and transport only; all domain logic lives in the lifecycle manager

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use skiff_sandbox::manager::{CreateOptions, ExecParams, ExecResult};
use skiff_sandbox::store::{SandboxRecord, StopReason};

use super::CallerIdentity;
use crate::error::{AppError, AppJson};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSandboxRequest {
    pub user_id: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub config: Option<JsonValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: Option<JsonValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorRequest {
    pub message: String,
    #[serde(default)]
    pub details: Option<JsonValue>,
}

#[derive(Deserialize)]
pub struct DestroyQuery {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

fn default_graceful() -> bool {
    true
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

const OK: OkResponse = OkResponse { ok: true };

pub async fn create_sandbox(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    AppJson(req): AppJson<CreateSandboxRequest>,
) -> Result<(StatusCode, Json<SandboxRecord>), AppError> {
    let record = state
        .manager
        .create_sandbox(
            &caller,
            &req.user_id,
            CreateOptions {
                ttl_seconds: req.ttl_seconds,
                config: req.config,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
) -> Result<Json<Vec<SandboxRecord>>, AppError> {
    Ok(Json(state.manager.list_sandboxes(&caller).await?))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
) -> Result<Json<SandboxRecord>, AppError> {
    Ok(Json(state.manager.get_sandbox(&caller, &id).await?))
}

pub async fn exec_command(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
    AppJson(req): AppJson<ExecRequest>,
) -> Result<Json<ExecResult>, AppError> {
    let result = state
        .manager
        .exec_in_sandbox(
            &caller,
            &id,
            ExecParams {
                command: req.command,
                cwd: req.cwd,
                timeout: req.timeout_seconds.map(Duration::from_secs),
            },
        )
        .await?;
    Ok(Json(result))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    state.manager.heartbeat(&caller, &id).await?;
    Ok(Json(OK))
}

pub async fn complete(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
    AppJson(req): AppJson<CompleteRequest>,
) -> Result<Json<OkResponse>, AppError> {
    state.manager.mark_complete(&caller, &id, req.result).await?;
    Ok(Json(OK))
}

pub async fn report_error(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
    AppJson(req): AppJson<ErrorRequest>,
) -> Result<Json<OkResponse>, AppError> {
    state
        .manager
        .mark_error(&caller, &id, req.message, req.details)
        .await?;
    Ok(Json(OK))
}

pub async fn destroy_sandbox(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Result<Json<SandboxRecord>, AppError> {
    let record = state
        .manager
        .destroy_sandbox(&caller, &id, query.graceful, StopReason::UserRequested)
        .await?;
    Ok(Json(record))
}
