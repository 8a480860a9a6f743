// ABOUTME: HTTP error surface: maps domain errors to status codes and a JSON envelope
// ABOUTME: 500s carry a correlation id that is also written to the log

use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use skiff_sandbox::manager::ManagerError;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("missing API key")]
    Unauthenticated,

    #[error("invalid API key")]
    Forbidden,

    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Manager(e) => match e {
                ManagerError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
                ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ManagerError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                ManagerError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                ManagerError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
                ManagerError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                ManagerError::EngineUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable")
                }
                ManagerError::StoreUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                }
                ManagerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();

        // Internal failures get a correlation id and full server-side context;
        // the client never sees a stack trace.
        let (message, correlation_id) = if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation_id = Uuid::new_v4().to_string();
            error!(%correlation_id, error = %self, "internal error");
            (
                "internal server error".to_string(),
                Some(correlation_id),
            )
        } else {
            (self.to_string(), None)
        };

        let body = ErrorBody {
            error: ErrorDetail {
                kind,
                message,
                correlation_id,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// JSON extractor that reports malformed or unknown-field bodies as a 422
/// validation error instead of axum's default 400.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(AppError::Validation(rejection.body_text())),
        }
    }
}
