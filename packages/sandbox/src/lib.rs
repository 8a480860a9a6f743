// ABOUTME: Sandbox domain library for the skiff orchestrator
// ABOUTME: Registry store, container driver, object-store gateway, and lifecycle manager

pub mod driver;
pub mod locks;
pub mod manager;
pub mod objectstore;
pub mod reaper;
pub mod store;

pub use driver::{ContainerDriver, ContainerSpec, DockerDriver, DriverError, EngineState};
pub use manager::{
    Caller, CreateOptions, ExecParams, ExecResult, ManagerError, SandboxManager, SandboxSettings,
};
pub use objectstore::{GatewayError, ObjectStoreGateway};
pub use reaper::{Reaper, ReaperConfig};
pub use store::{
    MemoryStore, PostgresStore, RecordPatch, SandboxRecord, SandboxStatus, SandboxStore,
    StopReason, StoreError,
};
