// ABOUTME: HTTP-level tests for the orchestrator API
// ABOUTME: Drives the full router with a scriptable in-process driver, no Docker required

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use skiff_orchestrator::config::Config;
use skiff_orchestrator::state::AppState;
use skiff_orchestrator::api;

use skiff_sandbox::driver::{
    ContainerDriver, ContainerSpec, ContainerState, DriverError, EngineState, ExecOutcome,
    LabeledContainer, Result as DriverResult,
};
use skiff_sandbox::manager::{SandboxManager, SandboxSettings, CWD_MARKER};
use skiff_sandbox::store::MemoryStore;

/// Minimal scriptable driver: containers are ids in a set, execs pop a queue.
#[derive(Default)]
struct StubDriver {
    containers: Mutex<HashMap<String, EngineState>>,
    exec_queue: Mutex<VecDeque<ExecOutcome>>,
    next_id: Mutex<u64>,
}

impl StubDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_exec(&self, exit_code: i64, stdout: &str, stderr: &str) {
        self.exec_queue.lock().unwrap().push_back(ExecOutcome {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }
}

#[async_trait]
impl ContainerDriver for StubDriver {
    async fn create(&self, _spec: &ContainerSpec) -> DriverResult<String> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = format!("ctr-{}", *next);
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), EngineState::Created);
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> DriverResult<()> {
        self.containers
            .lock()
            .unwrap()
            .insert(container_id.to_string(), EngineState::Running);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> DriverResult<ContainerState> {
        let containers = self.containers.lock().unwrap();
        let state = containers
            .get(container_id)
            .copied()
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        Ok(ContainerState {
            state,
            exit_code: None,
            started_at: None,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        _cwd: Option<&str>,
        _deadline: Duration,
    ) -> DriverResult<ExecOutcome> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(DriverError::NotFound(container_id.to_string()));
        }
        // readiness probe
        if command.first().map(String::as_str) == Some("test") {
            return Ok(ExecOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(self
            .exec_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ExecOutcome {
                exit_code: 0,
                stdout: format!("\n{CWD_MARKER}/home/agent\n"),
                stderr: String::new(),
            }))
    }

    async fn stop(&self, _container_id: &str, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> DriverResult<()> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn list_by_label(&self, _label: &str, _value: &str) -> DriverResult<Vec<LabeledContainer>> {
        Ok(Vec::new())
    }
}

fn test_app(api_key: &str) -> (Router, Arc<StubDriver>) {
    let mut config = Config::default();
    config.api_key = api_key.to_string();

    let driver = StubDriver::new();
    let settings = SandboxSettings {
        readiness_poll_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let manager = Arc::new(SandboxManager::new(
        Arc::new(MemoryStore::new()),
        driver.clone(),
        None,
        settings,
    ));

    let state = AppState::new(manager, Arc::new(config));
    (api::router(state), driver)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_open_and_reports_version() {
    let (app, _driver) = test_app("super-secret");

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["active_sandboxes"], 0);
}

#[tokio::test]
async fn missing_api_key_is_401_and_wrong_key_is_403() {
    let (app, _driver) = test_app("super-secret");

    let (status, body) = send(&app, get("/sandboxes")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthenticated");

    let request = Request::builder()
        .uri("/sandboxes")
        .header("X-API-Key", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "forbidden");
}

#[tokio::test]
async fn bearer_token_is_accepted() {
    let (app, _driver) = test_app("super-secret");

    let request = Request::builder()
        .uri("/sandboxes")
        .header("Authorization", "Bearer super-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn empty_configured_key_disables_auth() {
    let (app, _driver) = test_app("");

    let (status, _body) = send(&app, get("/sandboxes")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn create_exec_destroy_round_trip() {
    let (app, driver) = test_app("");

    let (status, sandbox) = send(
        &app,
        post_json("/sandboxes", json!({"user_id": "u-alice", "ttl_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sandbox["status"], "ready");
    assert_eq!(sandbox["user_id"], "u-alice");
    assert_eq!(sandbox["cwd"], "/home/agent");
    assert!(sandbox["expires_at"].is_string());
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    driver.push_exec(0, &format!("hi\n\n{CWD_MARKER}/home/agent\n"), "");
    let (status, result) = send(
        &app,
        post_json(&format!("/sandboxes/{id}/exec"), json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["stdout"], "hi\n");
    assert_eq!(result["stderr"], "");
    assert_eq!(result["cwd"], "/home/agent");

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/sandboxes/{id}?graceful=true"))
        .body(Body::empty())
        .unwrap();
    let (status, stopped) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");
    assert_eq!(stopped["stop_reason"], "user_requested");
}

#[tokio::test]
async fn cwd_persists_across_execs() {
    let (app, driver) = test_app("");

    let (_, sandbox) = send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    driver.push_exec(0, &format!("\n{CWD_MARKER}/tmp/x\n"), "");
    let (status, moved) = send(
        &app,
        post_json(
            &format!("/sandboxes/{id}/exec"),
            json!({"command": "mkdir -p /tmp/x && cd /tmp/x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["cwd"], "/tmp/x");

    driver.push_exec(0, &format!("/tmp/x\n\n{CWD_MARKER}/tmp/x\n"), "");
    let (_, pwd) = send(
        &app,
        post_json(&format!("/sandboxes/{id}/exec"), json!({"command": "pwd"})),
    )
    .await;
    assert_eq!(pwd["stdout"], "/tmp/x\n");
}

#[tokio::test]
async fn cross_user_get_is_404_not_403() {
    let (app, _driver) = test_app("");

    let (_, sandbox) = send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/sandboxes/{id}"))
        .header("X-User-Id", "u-bob")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn listing_is_scoped_by_the_user_header() {
    let (app, _driver) = test_app("");

    send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    send(&app, post_json("/sandboxes", json!({"user_id": "u-bob"}))).await;

    let request = Request::builder()
        .uri("/sandboxes")
        .header("X-User-Id", "u-alice")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["user_id"], "u-alice");

    let (_, all) = send(&app, get("/sandboxes")).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_body_fields_reject_as_422() {
    let (app, _driver) = test_app("");

    let (status, body) = send(
        &app,
        post_json("/sandboxes", json!({"user_id": "u-alice", "bogus": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn invalid_user_id_rejects_as_422() {
    let (app, _driver) = test_app("");

    let (status, _body) = send(
        &app,
        post_json("/sandboxes", json!({"user_id": "not valid!"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_sandbox_is_404() {
    let (app, _driver) = test_app("");

    let (status, _) = send(&app, get("/sandboxes/sbx-nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        post_json("/sandboxes/sbx-nope/exec", json!({"command": "id"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, post_json("/sandboxes/sbx-nope/heartbeat", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exec_after_destroy_is_409_invalid_state() {
    let (app, _driver) = test_app("");

    let (_, sandbox) = send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/sandboxes/{id}"))
        .body(Body::empty())
        .unwrap();
    send(&app, request).await;

    let (status, body) = send(
        &app,
        post_json(&format!("/sandboxes/{id}/exec"), json!({"command": "id"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_state");
}

#[tokio::test]
async fn destroy_is_idempotent_over_http() {
    let (app, _driver) = test_app("");

    let (_, sandbox) = send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/sandboxes/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["stop_reason"], "user_requested");
    }
}

#[tokio::test]
async fn heartbeat_complete_and_error_acknowledge() {
    let (app, _driver) = test_app("");

    let (_, sandbox) = send(&app, post_json("/sandboxes", json!({"user_id": "u-alice"}))).await;
    let id = sandbox["sandbox_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, post_json(&format!("/sandboxes/{id}/heartbeat"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _) = send(
        &app,
        post_json(
            &format!("/sandboxes/{id}/complete"),
            json!({"result": {"files": 2}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        post_json(
            &format!("/sandboxes/{id}/error"),
            json!({"message": "agent crashed", "details": {"signal": 9}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // completion and error reports leave the sandbox alive
    let (_, after) = send(&app, get(&format!("/sandboxes/{id}"))).await;
    assert_eq!(after["status"], "ready");
    assert_eq!(after["config"]["last_error"]["message"], "agent crashed");
}
