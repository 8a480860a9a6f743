// ABOUTME: HTTP control plane for the skiff sandbox orchestrator
// ABOUTME: Transport, authentication, validation, and error mapping; no domain logic

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod state;

pub use config::{Config, ConfigError, LogFormat, StoreBackend};
pub use error::AppError;
pub use state::AppState;
