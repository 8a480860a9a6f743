// ABOUTME: Sandbox registry records, status state machine, and the store trait
// ABOUTME: Persistence contract shared by the memory and postgres backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Default in-container mount point for the eagerly synced working set.
pub const DEFAULT_HOT_PATH: &str = "/home/agent";
/// Default in-container mount point for the lazily projected archive tier.
pub const DEFAULT_COLD_PATH: &str = "/data/cold";
/// Default lease length for a new sandbox.
pub const DEFAULT_TTL_SECONDS: i64 = 7200;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sandbox already exists: {0}")]
    Conflict(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Starting,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
    Expired,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "shutting_down" => Ok(Self::ShuttingDown),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(StoreError::InvalidStatus(s.to_string())),
        }
    }

    /// Absorbing states. `Expired` is not terminal: the expiry sweep still
    /// drives it through `ShuttingDown` to `Stopped`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// A record in one of these states may have a live container behind it.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Starting | Self::Ready | Self::Running | Self::ShuttingDown
        )
    }

    /// The lifecycle state machine. Every status mutation in the system is
    /// checked against this table; there are no other legal edges.
    pub fn can_transition(&self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, to),
            (Creating, Starting)
                | (Creating, Failed)
                | (Creating, ShuttingDown)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, ShuttingDown)
                | (Ready, Running)
                | (Ready, Expired)
                | (Ready, ShuttingDown)
                | (Running, Expired)
                | (Running, ShuttingDown)
                | (Expired, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    Expired,
    Error,
    GracefulShutdown,
    Admin,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::Expired => "expired",
            Self::Error => "error",
            Self::GracefulShutdown => "graceful_shutdown",
            Self::Admin => "admin",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user_requested" => Ok(Self::UserRequested),
            "expired" => Ok(Self::Expired),
            "error" => Ok(Self::Error),
            "graceful_shutdown" => Ok(Self::GracefulShutdown),
            "admin" => Ok(Self::Admin),
            _ => Err(StoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// One row in the sandbox registry. Records are never hard-deleted by the
/// lifecycle; terminal records stay behind as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub user_id: String,
    pub container_id: Option<String>,
    pub status: SandboxStatus,
    pub hot_path: String,
    pub cold_path: String,
    pub cwd: String,
    pub config: JsonValue,
    pub ttl_seconds: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(sandbox_id: String, user_id: String, config: JsonValue, ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            sandbox_id,
            user_id,
            container_id: None,
            status: SandboxStatus::Creating,
            hot_path: DEFAULT_HOT_PATH.to_string(),
            cold_path: DEFAULT_COLD_PATH.to_string(),
            cwd: DEFAULT_HOT_PATH.to_string(),
            config,
            ttl_seconds,
            expires_at: None,
            last_heartbeat_at: None,
            stopped_at: None,
            stop_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied atomically by [`SandboxStore::update`]. Absent
/// fields are left untouched; `updated_at` always advances.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<SandboxStatus>,
    pub container_id: Option<String>,
    pub cwd: Option<String>,
    pub config: Option<JsonValue>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}

impl RecordPatch {
    pub fn status(status: SandboxStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut SandboxRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(container_id) = &self.container_id {
            record.container_id = Some(container_id.clone());
        }
        if let Some(cwd) = &self.cwd {
            record.cwd = cwd.clone();
        }
        if let Some(config) = &self.config {
            record.config = config.clone();
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = Some(expires_at);
        }
        if let Some(last_heartbeat_at) = self.last_heartbeat_at {
            record.last_heartbeat_at = Some(last_heartbeat_at);
        }
        if let Some(stopped_at) = self.stopped_at {
            record.stopped_at = Some(stopped_at);
        }
        if let Some(stop_reason) = self.stop_reason {
            record.stop_reason = Some(stop_reason);
        }
        record.updated_at = Utc::now();
    }
}

/// Persistence contract for sandbox records. Implementations must be
/// behaviorally interchangeable; per-user scoping happens here, not at the
/// API layer.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Conflict`] when the
    /// sandbox id already exists.
    async fn save(&self, record: &SandboxRecord) -> Result<()>;

    async fn get(&self, sandbox_id: &str) -> Result<SandboxRecord>;

    /// All records for a user, or all records when `user_id` is `None`
    /// (operator use). Order is unspecified.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>>;

    /// Apply a partial update atomically and return the updated record.
    async fn update(&self, sandbox_id: &str, patch: RecordPatch) -> Result<SandboxRecord>;

    /// Hard removal. The lifecycle never calls this; it exists for
    /// operational cleanup. Returns whether a record was removed.
    async fn delete(&self, sandbox_id: &str) -> Result<bool>;

    /// Records in `ready`/`running` whose lease deadline has passed.
    /// A record whose `expires_at` equals `now` exactly is expired.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SandboxStatus::Creating,
            SandboxStatus::Starting,
            SandboxStatus::Ready,
            SandboxStatus::Running,
            SandboxStatus::ShuttingDown,
            SandboxStatus::Stopped,
            SandboxStatus::Failed,
            SandboxStatus::Expired,
        ] {
            assert_eq!(SandboxStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SandboxStatus::from_str("paused").is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        use SandboxStatus::*;
        let all = [
            Creating,
            Starting,
            Ready,
            Running,
            ShuttingDown,
            Stopped,
            Failed,
            Expired,
        ];
        for from in [Stopped, Failed] {
            for to in all {
                assert!(
                    !from.can_transition(to),
                    "{} -> {} must be illegal",
                    from.as_str(),
                    to.as_str()
                );
            }
        }
    }

    #[test]
    fn no_backward_transitions() {
        use SandboxStatus::*;
        assert!(!Ready.can_transition(Starting));
        assert!(!Running.can_transition(Ready));
        assert!(!ShuttingDown.can_transition(Running));
        assert!(!Expired.can_transition(Running));
        assert!(!Stopped.can_transition(ShuttingDown));
    }

    #[test]
    fn expiry_path_flows_through_shutting_down() {
        use SandboxStatus::*;
        assert!(Ready.can_transition(Expired));
        assert!(Running.can_transition(Expired));
        assert!(Expired.can_transition(ShuttingDown));
        assert!(ShuttingDown.can_transition(Stopped));
        assert!(!Expired.can_transition(Stopped));
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut record = SandboxRecord::new(
            "sbx-1".into(),
            "u-alice".into(),
            serde_json::json!({}),
            7200,
        );
        let before = record.updated_at;
        let patch = RecordPatch {
            status: Some(SandboxStatus::Starting),
            container_id: Some("c-1".into()),
            ..Default::default()
        };
        patch.apply(&mut record);
        assert_eq!(record.status, SandboxStatus::Starting);
        assert_eq!(record.container_id.as_deref(), Some("c-1"));
        assert_eq!(record.cwd, DEFAULT_HOT_PATH);
        assert!(record.updated_at >= before);
    }
}
