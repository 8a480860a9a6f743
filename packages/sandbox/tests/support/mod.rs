// ABOUTME: Test support: a scriptable in-process container driver
// ABOUTME: Stands in for the engine so lifecycle tests run without Docker

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skiff_sandbox::driver::{
    ContainerDriver, ContainerSpec, ContainerState, DriverError, EngineState, ExecOutcome,
    LabeledContainer, Result as DriverResult, SANDBOX_ID_LABEL,
};
use skiff_sandbox::manager::{SandboxManager, SandboxSettings, CWD_MARKER};
use skiff_sandbox::store::MemoryStore;

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    exec_queue: VecDeque<ExecOutcome>,
    calls: Vec<String>,
    fail_next_create: bool,
    ready: bool,
    next_id: u64,
}

struct FakeContainer {
    state: EngineState,
    labels: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self::default();
        driver.state.lock().unwrap().ready = true;
        Arc::new(driver)
    }

    pub fn push_exec(&self, exit_code: i64, stdout: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .exec_queue
            .push_back(ExecOutcome {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().unwrap().ready = ready;
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    /// Simulate the container vanishing behind the orchestrator's back.
    pub fn remove_externally(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }

    /// Inject a container the registry knows nothing about.
    pub fn add_orphan(&self, container_id: &str) {
        self.state.lock().unwrap().containers.insert(
            container_id.to_string(),
            FakeContainer {
                state: EngineState::Running,
                labels: HashMap::new(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.state == EngineState::Running)
            .count()
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create".to_string());
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err(DriverError::Engine("injected create failure".to_string()));
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                state: EngineState::Created,
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("start".to_string());
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.state = EngineState::Running;
                Ok(())
            }
            None => Err(DriverError::NotFound(container_id.to_string())),
        }
    }

    async fn inspect(&self, container_id: &str) -> DriverResult<ContainerState> {
        let state = self.state.lock().unwrap();
        match state.containers.get(container_id) {
            Some(container) => Ok(ContainerState {
                state: container.state,
                exit_code: None,
                started_at: None,
            }),
            None => Err(DriverError::NotFound(container_id.to_string())),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        _cwd: Option<&str>,
        _deadline: Duration,
    ) -> DriverResult<ExecOutcome> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        if container.state != EngineState::Running {
            return Err(DriverError::NotRunning {
                container_id: container_id.to_string(),
                state: container.state.as_str().to_string(),
            });
        }

        // Readiness probes arrive as a bare `test -f <marker>` argv.
        if command.first().map(String::as_str) == Some("test") {
            let exit_code = if state.ready { 0 } else { 1 };
            return Ok(ExecOutcome {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        state.calls.push("exec".to_string());
        Ok(state
            .exec_queue
            .pop_front()
            .unwrap_or_else(|| ExecOutcome {
                exit_code: 0,
                stdout: marker_line("/home/agent"),
                stderr: String::new(),
            }))
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stop".to_string());
        if let Some(container) = state.containers.get_mut(container_id) {
            container.state = EngineState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("remove".to_string());
        state.containers.remove(container_id);
        Ok(())
    }

    async fn list_by_label(&self, _label: &str, _value: &str) -> DriverResult<Vec<LabeledContainer>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.state == EngineState::Running)
            .map(|(id, c)| LabeledContainer {
                container_id: id.clone(),
                sandbox_id: c.labels.get(SANDBOX_ID_LABEL).cloned(),
                state: c.state,
            })
            .collect())
    }
}

/// The stdout marker line the exec wrapper expects, as the shell emits it.
pub fn marker_line(cwd: &str) -> String {
    format!("\n{CWD_MARKER}{cwd}\n")
}

pub fn fast_settings() -> SandboxSettings {
    SandboxSettings {
        readiness_poll_interval: Duration::from_millis(1),
        readiness_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn setup() -> (Arc<SandboxManager>, Arc<FakeDriver>, Arc<MemoryStore>) {
    setup_with(fast_settings())
}

pub fn setup_with(
    settings: SandboxSettings,
) -> (Arc<SandboxManager>, Arc<FakeDriver>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let driver = FakeDriver::new();
    let manager = Arc::new(SandboxManager::new(
        store.clone(),
        driver.clone(),
        None,
        settings,
    ));
    (manager, driver, store)
}
