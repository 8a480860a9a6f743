// ABOUTME: Sandbox lifecycle manager, the single source of truth for state transitions
// ABOUTME: Composes the registry store, container driver, and object-store gateway

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::driver::{
    ContainerDriver, ContainerSpec, DriverError, EngineState, SANDBOX_ID_LABEL, USER_ID_LABEL,
};
use crate::locks::LockMap;
use crate::objectstore::ObjectStoreGateway;
use crate::store::{
    RecordPatch, SandboxRecord, SandboxStatus, SandboxStore, StopReason, StoreError,
};

/// File the in-container startup sequence writes once the sandbox is usable.
pub const READY_MARKER_PATH: &str = "/tmp/.skiff_ready";

/// Sentinel prefixing the shell's final working directory on the last line of
/// exec stdout. Stripped before output is returned to the caller.
pub const CWD_MARKER: &str = "__SKIFF_CWD__";

/// Exit code the exec wrapper reserves for "the working directory is gone".
const CWD_MISSING_EXIT: i64 = 96;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox already exists: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("registry store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

impl From<StoreError> for ManagerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => ManagerError::Conflict(id),
            StoreError::NotFound(id) => ManagerError::NotFound(id),
            StoreError::Unavailable(msg) => ManagerError::StoreUnavailable(msg),
            StoreError::Database(e) => ManagerError::StoreUnavailable(e.to_string()),
            other => ManagerError::Internal(other.to_string()),
        }
    }
}

impl From<DriverError> for ManagerError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::EngineUnavailable(msg) => ManagerError::EngineUnavailable(msg),
            DriverError::Timeout(d) => ManagerError::Timeout(d),
            DriverError::NotRunning { container_id, state } => ManagerError::InvalidState(
                format!("container {container_id} is not running (state: {state})"),
            ),
            other => ManagerError::Internal(other.to_string()),
        }
    }
}

/// Identity an operation runs under. `None` is the operator scope: it sees
/// every record. A scoped caller only ever observes its own sandboxes.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub user_id: Option<String>,
}

impl Caller {
    pub fn admin() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    fn scope(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub ttl_seconds: Option<i64>,
    pub config: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: String,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub cwd: String,
}

/// Deployment policy for sandboxes. Loaded once at startup from the process
/// configuration and held by the manager.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image_ref: String,
    pub bucket: String,
    pub region: String,
    pub docker_network: String,
    pub orchestrator_url: String,
    pub default_ttl_seconds: i64,
    pub exec_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub max_command_bytes: usize,
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image_ref: "skiff-sandbox:latest".to_string(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            docker_network: "bridge".to_string(),
            orchestrator_url: "http://host.docker.internal:8000".to_string(),
            default_ttl_seconds: 7200,
            exec_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(60),
            readiness_poll_interval: Duration::from_secs(2),
            max_command_bytes: 10_000,
            cpu_limit: 2.0,
            memory_limit_mb: 4096,
        }
    }
}

pub struct SandboxManager {
    store: Arc<dyn SandboxStore>,
    driver: Arc<dyn ContainerDriver>,
    objects: Option<Arc<ObjectStoreGateway>>,
    settings: SandboxSettings,
    locks: LockMap,
}

impl SandboxManager {
    pub fn new(
        store: Arc<dyn SandboxStore>,
        driver: Arc<dyn ContainerDriver>,
        objects: Option<Arc<ObjectStoreGateway>>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            store,
            driver,
            objects,
            settings,
            locks: LockMap::new(),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    pub fn driver(&self) -> &Arc<dyn ContainerDriver> {
        &self.driver
    }

    /// Create and start a sandbox for a user, returning once it is ready or
    /// cleaning up and failing the record otherwise.
    pub async fn create_sandbox(
        &self,
        caller: &Caller,
        user_id: &str,
        opts: CreateOptions,
    ) -> Result<SandboxRecord> {
        if !is_valid_user_id(user_id) {
            return Err(ManagerError::Validation(format!(
                "invalid user id: {user_id:?}"
            )));
        }
        if let Some(scope) = caller.scope() {
            if scope != user_id {
                return Err(ManagerError::Forbidden(
                    "cannot create a sandbox for another user".to_string(),
                ));
            }
        }

        let ttl_seconds = opts.ttl_seconds.unwrap_or(self.settings.default_ttl_seconds);
        if ttl_seconds < 1 {
            return Err(ManagerError::Validation(
                "ttl_seconds must be at least 1".to_string(),
            ));
        }

        let config = opts.config.unwrap_or_else(|| json!({}));
        if !config.is_object() {
            return Err(ManagerError::Validation(
                "config must be a JSON object".to_string(),
            ));
        }

        if let Some(objects) = &self.objects {
            objects
                .ensure_user_prefixes(user_id)
                .await
                .map_err(|e| ManagerError::Internal(e.to_string()))?;
        }

        let sandbox_id = new_sandbox_id();
        let record = SandboxRecord::new(
            sandbox_id.clone(),
            user_id.to_string(),
            config,
            ttl_seconds,
        );
        self.store.save(&record).await?;

        info!(%sandbox_id, %user_id, "creating sandbox");

        let guard = self.locks.acquire(&sandbox_id).await;
        let result = self.provision(&record).await;
        if let Err(e) = &result {
            error!(%sandbox_id, error = %e, "sandbox provisioning failed");
            self.fail_sandbox(&sandbox_id).await;
        }
        drop(guard);

        if result.is_err() {
            self.locks.prune(&sandbox_id);
        }
        result
    }

    async fn provision(&self, record: &SandboxRecord) -> Result<SandboxRecord> {
        let spec = self.container_spec(record)?;

        let container_id = self.driver.create(&spec).await?;
        let rec = self
            .transition_locked(
                &record.sandbox_id,
                SandboxStatus::Starting,
                RecordPatch {
                    container_id: Some(container_id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.driver.start(&container_id).await?;
        self.wait_for_ready(&container_id).await?;

        let expires_at = Utc::now() + chrono::Duration::seconds(rec.ttl_seconds);
        let ready = self
            .transition_locked(
                &record.sandbox_id,
                SandboxStatus::Ready,
                RecordPatch {
                    expires_at: Some(expires_at),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            sandbox_id = %ready.sandbox_id,
            user_id = %ready.user_id,
            expires_at = %expires_at,
            "sandbox ready"
        );
        Ok(ready)
    }

    fn container_spec(&self, record: &SandboxRecord) -> Result<ContainerSpec> {
        let config = record.config.as_object();

        let str_opt = |key: &str| -> Option<String> {
            config
                .and_then(|c| c.get(key))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        };

        let image = str_opt("image").unwrap_or_else(|| self.settings.image_ref.clone());
        let bucket = str_opt("s3_bucket").unwrap_or_else(|| self.settings.bucket.clone());
        let region = str_opt("s3_region").unwrap_or_else(|| self.settings.region.clone());
        let cpu_limit = config
            .and_then(|c| c.get("cpu_limit"))
            .and_then(JsonValue::as_f64)
            .unwrap_or(self.settings.cpu_limit);
        let memory_limit_mb = config
            .and_then(|c| c.get("memory_limit_mb"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(self.settings.memory_limit_mb);

        let mut env = HashMap::from([
            ("SANDBOX_ID".to_string(), record.sandbox_id.clone()),
            ("USER_ID".to_string(), record.user_id.clone()),
            ("S3_BUCKET".to_string(), bucket),
            ("S3_REGION".to_string(), region),
            ("HOT_PATH".to_string(), record.hot_path.clone()),
            ("COLD_PATH".to_string(), record.cold_path.clone()),
            (
                "SHUTDOWN_TIMEOUT_SECONDS".to_string(),
                self.settings.shutdown_timeout.as_secs().to_string(),
            ),
            (
                "ORCHESTRATOR_URL".to_string(),
                self.settings.orchestrator_url.clone(),
            ),
        ]);

        if let Some(overrides) = config.and_then(|c| c.get("env")).and_then(JsonValue::as_object) {
            for (key, value) in overrides {
                match value.as_str() {
                    Some(value) => {
                        env.insert(key.clone(), value.to_string());
                    }
                    None => {
                        return Err(ManagerError::Validation(format!(
                            "config env override {key:?} must be a string"
                        )))
                    }
                }
            }
        }

        Ok(ContainerSpec {
            image,
            name: record.sandbox_id.clone(),
            env,
            cpu_limit,
            memory_limit_mb,
            labels: HashMap::from([
                (SANDBOX_ID_LABEL.to_string(), record.sandbox_id.clone()),
                (USER_ID_LABEL.to_string(), record.user_id.clone()),
            ]),
            network: self.settings.docker_network.clone(),
        })
    }

    /// Poll for the in-container readiness marker until it appears or the
    /// startup deadline passes.
    async fn wait_for_ready(&self, container_id: &str) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            let state = self.driver.inspect(container_id).await?;
            if matches!(state.state, EngineState::Exited | EngineState::Dead) {
                return Err(ManagerError::Internal(format!(
                    "container exited during startup (exit code {:?})",
                    state.exit_code
                )));
            }

            let probe = self
                .driver
                .exec(
                    container_id,
                    vec![
                        "test".to_string(),
                        "-f".to_string(),
                        READY_MARKER_PATH.to_string(),
                    ],
                    None,
                    Duration::from_secs(10),
                )
                .await;

            match probe {
                Ok(outcome) if outcome.exit_code == 0 => return Ok(()),
                Ok(_) => {}
                // Not accepting execs yet; keep polling until the deadline.
                Err(DriverError::NotRunning { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= self.settings.readiness_timeout {
                return Err(ManagerError::Timeout(self.settings.readiness_timeout));
            }
            tokio::time::sleep(self.settings.readiness_poll_interval).await;
        }
    }

    /// Best-effort cleanup after a failed provision: remove the container if
    /// one was created and park the record in `failed`. Caller holds the lock.
    async fn fail_sandbox(&self, sandbox_id: &str) {
        let record = match self.store.get(sandbox_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(%sandbox_id, error = %e, "could not load record after failed provision");
                return;
            }
        };

        if let Some(container_id) = &record.container_id {
            if let Err(e) = self.driver.remove(container_id).await {
                warn!(%sandbox_id, %container_id, error = %e, "failed to remove container of failed sandbox");
            }
        }

        if !record.status.can_transition(SandboxStatus::Failed) {
            return;
        }
        let patch = RecordPatch {
            status: Some(SandboxStatus::Failed),
            stopped_at: Some(Utc::now()),
            stop_reason: Some(StopReason::Error),
            ..Default::default()
        };
        if let Err(e) = self.store.update(sandbox_id, patch).await {
            error!(%sandbox_id, error = %e, "failed to mark sandbox as failed");
        }
    }

    pub async fn get_sandbox(&self, caller: &Caller, sandbox_id: &str) -> Result<SandboxRecord> {
        let record = self.store.get(sandbox_id).await?;
        authorize(caller, record)
    }

    pub async fn list_sandboxes(&self, caller: &Caller) -> Result<Vec<SandboxRecord>> {
        Ok(self.store.list(caller.scope()).await?)
    }

    /// Run a command inside a sandbox, tracking the shell's final working
    /// directory. Execs against the same sandbox are serialized; the returned
    /// `cwd` is the server's view after this call.
    pub async fn exec_in_sandbox(
        &self,
        caller: &Caller,
        sandbox_id: &str,
        params: ExecParams,
    ) -> Result<ExecResult> {
        if params.command.is_empty() {
            return Err(ManagerError::Validation(
                "command must not be empty".to_string(),
            ));
        }
        if params.command.len() > self.settings.max_command_bytes {
            return Err(ManagerError::Validation(format!(
                "command exceeds maximum length of {} bytes",
                self.settings.max_command_bytes
            )));
        }
        if let Some(cwd) = &params.cwd {
            if !cwd.starts_with('/') {
                return Err(ManagerError::Validation(format!(
                    "cwd must be an absolute path: {cwd:?}"
                )));
            }
        }

        let _guard = self.locks.acquire(sandbox_id).await;

        let record = authorize(caller, self.store.get(sandbox_id).await?)?;
        if !matches!(
            record.status,
            SandboxStatus::Ready | SandboxStatus::Running
        ) {
            return Err(ManagerError::InvalidState(format!(
                "sandbox {sandbox_id} is {} and cannot execute commands",
                record.status.as_str()
            )));
        }

        let container_id = record.container_id.clone().ok_or_else(|| {
            ManagerError::InvalidState(format!("sandbox {sandbox_id} has no container"))
        })?;

        let cwd = params.cwd.unwrap_or_else(|| record.cwd.clone());
        let deadline = params.timeout.unwrap_or(self.settings.exec_timeout);
        let script = wrap_command(&params.command, &cwd);

        let outcome = match self
            .driver
            .exec(
                &container_id,
                vec!["bash".to_string(), "-c".to_string(), script],
                None,
                deadline,
            )
            .await
        {
            Ok(outcome) => outcome,
            // The container vanished under us: fold the drift into the
            // registry and tell the caller the sandbox is gone.
            Err(DriverError::NotFound(_)) => {
                warn!(%sandbox_id, %container_id, "container disappeared during exec");
                self.mark_lost_locked(&record).await?;
                self.locks.prune(sandbox_id);
                return Err(ManagerError::InvalidState(format!(
                    "sandbox {sandbox_id} no longer has a live container"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.exit_code == CWD_MISSING_EXIT {
            return Err(ManagerError::Validation(format!(
                "working directory does not exist: {cwd}"
            )));
        }

        let (stdout, reported_cwd) = split_cwd_marker(&outcome.stdout);

        let mut patch = RecordPatch {
            last_heartbeat_at: Some(Utc::now()),
            ..Default::default()
        };
        // Policy: a failed command does not move the server-tracked cwd.
        if outcome.exit_code == 0 {
            if let Some(new_cwd) = &reported_cwd {
                if *new_cwd != record.cwd {
                    patch.cwd = Some(new_cwd.clone());
                }
            }
        }
        if record.status == SandboxStatus::Ready {
            patch.status = Some(SandboxStatus::Running);
        }
        let updated = self.store.update(sandbox_id, patch).await?;

        Ok(ExecResult {
            exit_code: outcome.exit_code,
            stdout,
            stderr: outcome.stderr,
            cwd: updated.cwd,
        })
    }

    pub async fn heartbeat(&self, caller: &Caller, sandbox_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(sandbox_id).await;
        let record = authorize(caller, self.store.get(sandbox_id).await?)?;
        self.store
            .update(
                &record.sandbox_id,
                RecordPatch {
                    last_heartbeat_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Agent-signalled completion. Recorded into the config blob; the
    /// sandbox stays alive for inspection until destroyed or expired.
    pub async fn mark_complete(
        &self,
        caller: &Caller,
        sandbox_id: &str,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(sandbox_id).await;
        let record = authorize(caller, self.store.get(sandbox_id).await?)?;

        let completion = json!({
            "completed_at": Utc::now(),
            "result": result,
        });
        let config = merge_config(&record.config, "completion", completion);

        info!(%sandbox_id, "sandbox reported completion");
        self.store
            .update(
                &record.sandbox_id,
                RecordPatch {
                    config: Some(config),
                    last_heartbeat_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Agent-signalled error. Recorded for inspection; deliberately does not
    /// transition the record to `failed` — the sandbox is still alive.
    pub async fn mark_error(
        &self,
        caller: &Caller,
        sandbox_id: &str,
        message: String,
        details: Option<JsonValue>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(sandbox_id).await;
        let record = authorize(caller, self.store.get(sandbox_id).await?)?;

        error!(%sandbox_id, error = %message, "sandbox reported an error");
        let last_error = json!({
            "message": message,
            "details": details,
            "reported_at": Utc::now(),
        });
        let config = merge_config(&record.config, "last_error", last_error);

        self.store
            .update(
                &record.sandbox_id,
                RecordPatch {
                    config: Some(config),
                    last_heartbeat_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Tear a sandbox down. Idempotent: destroying an already-terminal
    /// record returns it unchanged.
    pub async fn destroy_sandbox(
        &self,
        caller: &Caller,
        sandbox_id: &str,
        graceful: bool,
        reason: StopReason,
    ) -> Result<SandboxRecord> {
        let guard = self.locks.acquire(sandbox_id).await;

        let record = authorize(caller, self.store.get(sandbox_id).await?)?;
        if record.status.is_terminal() {
            return Ok(record);
        }

        info!(%sandbox_id, graceful, reason = reason.as_str(), "destroying sandbox");
        let result = self.teardown_locked(&record, graceful, reason).await;
        drop(guard);

        if result.is_ok() {
            self.locks.prune(sandbox_id);
        }
        result
    }

    /// Expiry-sweep entry point: mark the lease as lapsed, then run the
    /// normal graceful teardown. Losing the race against a concurrent
    /// destroy is success.
    pub async fn expire_sandbox(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        let guard = self.locks.acquire(sandbox_id).await;

        let record = self.store.get(sandbox_id).await?;
        if !matches!(
            record.status,
            SandboxStatus::Ready | SandboxStatus::Running
        ) {
            return Ok(record);
        }

        info!(%sandbox_id, expires_at = ?record.expires_at, "sandbox lease expired");
        let expired = self
            .transition_locked(sandbox_id, SandboxStatus::Expired, RecordPatch::default())
            .await?;
        let result = self
            .teardown_locked(&expired, true, StopReason::Expired)
            .await;
        drop(guard);

        if result.is_ok() {
            self.locks.prune(sandbox_id);
        }
        result
    }

    /// Reconciliation entry point for a record whose container is gone.
    pub async fn mark_lost(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        let _guard = self.locks.acquire(sandbox_id).await;
        let record = self.store.get(sandbox_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        let stopped = self.mark_lost_locked(&record).await?;
        self.locks.prune(sandbox_id);
        Ok(stopped)
    }

    async fn mark_lost_locked(&self, record: &SandboxRecord) -> Result<SandboxRecord> {
        let sandbox_id = &record.sandbox_id;
        warn!(%sandbox_id, "container lost; marking sandbox stopped");

        if record.status != SandboxStatus::ShuttingDown {
            self.transition_locked(sandbox_id, SandboxStatus::ShuttingDown, RecordPatch::default())
                .await?;
        }
        let stopped = self
            .transition_locked(
                sandbox_id,
                SandboxStatus::Stopped,
                RecordPatch {
                    stopped_at: Some(Utc::now()),
                    stop_reason: Some(StopReason::Error),
                    ..Default::default()
                },
            )
            .await?;
        Ok(stopped)
    }

    async fn teardown_locked(
        &self,
        record: &SandboxRecord,
        graceful: bool,
        reason: StopReason,
    ) -> Result<SandboxRecord> {
        let sandbox_id = &record.sandbox_id;

        let rec = if record.status == SandboxStatus::ShuttingDown {
            record.clone()
        } else {
            self.transition_locked(
                sandbox_id,
                SandboxStatus::ShuttingDown,
                RecordPatch::default(),
            )
            .await?
        };

        if let Some(container_id) = &rec.container_id {
            if graceful {
                // Give the in-container shutdown protocol its full window,
                // plus a little slack, before the engine force-kills.
                let timeout = self.settings.shutdown_timeout + Duration::from_secs(10);
                if let Err(e) = self.driver.stop(container_id, timeout).await {
                    warn!(%sandbox_id, %container_id, error = %e, "graceful stop failed; removing anyway");
                }
            }
            self.driver.remove(container_id).await?;
        }

        let stopped = self
            .transition_locked(
                sandbox_id,
                SandboxStatus::Stopped,
                RecordPatch {
                    stopped_at: Some(Utc::now()),
                    stop_reason: Some(reason),
                    ..Default::default()
                },
            )
            .await?;

        info!(%sandbox_id, reason = reason.as_str(), "sandbox destroyed");
        Ok(stopped)
    }

    async fn transition_locked(
        &self,
        sandbox_id: &str,
        to: SandboxStatus,
        mut patch: RecordPatch,
    ) -> Result<SandboxRecord> {
        let current = self.store.get(sandbox_id).await?;
        if !current.status.can_transition(to) {
            return Err(ManagerError::InvalidState(format!(
                "sandbox {sandbox_id} cannot move from {} to {}",
                current.status.as_str(),
                to.as_str()
            )));
        }
        patch.status = Some(to);
        Ok(self.store.update(sandbox_id, patch).await?)
    }

    /// Records that may have a live container behind them (health surface).
    pub async fn active_sandbox_count(&self) -> Result<usize> {
        let records = self.store.list(None).await?;
        Ok(records.iter().filter(|r| r.status.is_active()).count())
    }
}

fn authorize(caller: &Caller, record: SandboxRecord) -> Result<SandboxRecord> {
    match caller.scope() {
        // A cross-user read answers NotFound, never Forbidden, so sandbox
        // ids cannot be probed for existence.
        Some(uid) if uid != record.user_id => Err(ManagerError::NotFound(record.sandbox_id)),
        _ => Ok(record),
    }
}

fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 255
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn new_sandbox_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("sbx-{}", &hex[..12])
}

fn merge_config(config: &JsonValue, key: &str, value: JsonValue) -> JsonValue {
    let mut object = config.as_object().cloned().unwrap_or_else(Map::new);
    object.insert(key.to_string(), value);
    JsonValue::Object(object)
}

/// Wrap a user command so the shell reports its final working directory on a
/// marker line, preserving the command's own exit code.
fn wrap_command(command: &str, cwd: &str) -> String {
    format!(
        "cd {} 2>/dev/null || exit {CWD_MISSING_EXIT}\n{{ {command}\n}}\n__rc=$?\nprintf '\\n%s%s\\n' '{CWD_MARKER}' \"$PWD\"\nexit $__rc",
        shell_quote(cwd)
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Split the marker line off captured stdout. Returns the remaining output
/// and the reported working directory, when present.
fn split_cwd_marker(stdout: &str) -> (String, Option<String>) {
    match stdout.rfind(CWD_MARKER) {
        None => (stdout.to_string(), None),
        Some(pos) => {
            let cwd = stdout[pos + CWD_MARKER.len()..]
                .trim_end_matches('\n')
                .to_string();
            let mut head = &stdout[..pos];
            if head.ends_with('\n') {
                head = &head[..head.len() - 1];
            }
            let cwd = if cwd.is_empty() { None } else { Some(cwd) };
            (head.to_string(), cwd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_validate() {
        assert!(is_valid_user_id("u-alice"));
        assert!(is_valid_user_id("User_1.test-2"));
        assert!(is_valid_user_id(&"a".repeat(255)));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id(&"a".repeat(256)));
        assert!(!is_valid_user_id("user id"));
        assert!(!is_valid_user_id("user/../../etc"));
        assert!(!is_valid_user_id("uséx"));
    }

    #[test]
    fn sandbox_ids_are_prefixed_and_unique() {
        let a = new_sandbox_id();
        let b = new_sandbox_id();
        assert!(a.starts_with("sbx-"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn wrapped_command_carries_cwd_and_marker() {
        let script = wrap_command("echo hi", "/tmp/work dir");
        assert!(script.starts_with("cd '/tmp/work dir' 2>/dev/null || exit 96"));
        assert!(script.contains("{ echo hi\n}"));
        assert!(script.contains(CWD_MARKER));
        assert!(script.ends_with("exit $__rc"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/a/b"), "'/a/b'");
        assert_eq!(shell_quote("/a'b"), r"'/a'\''b'");
    }

    #[test]
    fn marker_line_splits_off_stdout() {
        let stdout = format!("hi\n\n{CWD_MARKER}/tmp/x\n");
        let (out, cwd) = split_cwd_marker(&stdout);
        assert_eq!(out, "hi\n");
        assert_eq!(cwd.as_deref(), Some("/tmp/x"));
    }

    #[test]
    fn marker_on_empty_output() {
        let stdout = format!("\n{CWD_MARKER}/home/agent\n");
        let (out, cwd) = split_cwd_marker(&stdout);
        assert_eq!(out, "");
        assert_eq!(cwd.as_deref(), Some("/home/agent"));
    }

    #[test]
    fn missing_marker_leaves_output_untouched() {
        let (out, cwd) = split_cwd_marker("plain output\n");
        assert_eq!(out, "plain output\n");
        assert!(cwd.is_none());
    }

    #[test]
    fn config_merge_preserves_existing_keys() {
        let config = serde_json::json!({"image": "custom:1"});
        let merged = merge_config(&config, "completion", serde_json::json!({"ok": true}));
        assert_eq!(merged["image"], "custom:1");
        assert_eq!(merged["completion"]["ok"], true);
    }
}
