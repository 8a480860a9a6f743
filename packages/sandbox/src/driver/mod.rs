// ABOUTME: Container driver trait and engine-facing types
// ABOUTME: Thin capability interface hiding engine specifics from the lifecycle manager

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod docker;

pub use docker::DockerDriver;

/// Label carrying the sandbox id on every container this deployment owns.
pub const SANDBOX_ID_LABEL: &str = "skiff.sandbox_id";
/// Label carrying the owning user id.
pub const USER_ID_LABEL: &str = "skiff.user_id";
/// Marker label used by reconciliation to enumerate our containers.
pub const MANAGED_LABEL: &str = "skiff.managed";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container {container_id} is not running (state: {state})")]
    NotRunning {
        container_id: String,
        state: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Everything the engine needs to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    /// CPU cores; converted to engine quota units by the driver.
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub labels: HashMap<String, String>,
    pub network: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerState {
    pub state: EngineState,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct LabeledContainer {
    pub container_id: String,
    pub sandbox_id: Option<String>,
    pub state: EngineState,
}

/// Capability interface over the container engine. All interaction with the
/// engine socket goes through an implementation of this trait.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container. Partially created containers are removed before
    /// an error is returned; no engine record survives a failed create.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Begin execution. Returns when the engine accepts the start, not when
    /// the workload is ready.
    async fn start(&self, container_id: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;

    /// Run a command as the sandbox's unprivileged user. The engine state is
    /// re-inspected first; anything but running refuses with
    /// [`DriverError::NotRunning`]. `deadline` is a hard cut-off; on timeout
    /// the call returns [`DriverError::Timeout`] and the container is left
    /// running.
    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        cwd: Option<&str>,
        deadline: Duration,
    ) -> Result<ExecOutcome>;

    /// Deliver an orderly termination signal, wait up to `timeout`, then
    /// force-kill. An already-gone container counts as success.
    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()>;

    /// Force-remove; idempotent.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Running containers carrying `label=value`.
    async fn list_by_label(&self, label: &str, value: &str) -> Result<Vec<LabeledContainer>>;
}
