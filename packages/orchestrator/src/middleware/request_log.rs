// ABOUTME: Request logging middleware
// ABOUTME: One structured access-log line per request with timing and identity fields

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::api::USER_ID_HEADER;

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let start = Instant::now();
    let response = next.run(request).await;
    let duration_ms = (start.elapsed().as_secs_f64() * 10_000.0).round() / 10.0;

    info!(
        target: "skiff::access",
        %method,
        %path,
        status = response.status().as_u16(),
        duration_ms,
        sandbox_id = sandbox_id_from_path(&path).unwrap_or("-"),
        user_id = user_id.as_deref().unwrap_or("-"),
        "request"
    );

    response
}

/// Pull the sandbox id out of `/sandboxes/{id}[/...]` paths.
fn sandbox_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/sandboxes/")?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sandbox_ids() {
        assert_eq!(sandbox_id_from_path("/sandboxes/sbx-1"), Some("sbx-1"));
        assert_eq!(sandbox_id_from_path("/sandboxes/sbx-1/exec"), Some("sbx-1"));
        assert_eq!(sandbox_id_from_path("/sandboxes"), None);
        assert_eq!(sandbox_id_from_path("/health"), None);
    }
}
