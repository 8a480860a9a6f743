// ABOUTME: Shared application state handed to every request handler

use std::sync::Arc;
use std::time::Instant;

use skiff_sandbox::manager::SandboxManager;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<SandboxManager>, config: Arc<Config>) -> Self {
        Self {
            manager,
            config,
            started_at: Instant::now(),
        }
    }
}
