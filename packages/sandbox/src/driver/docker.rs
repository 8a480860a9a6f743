// ABOUTME: Docker implementation of the container driver using bollard
// ABOUTME: Owns the engine socket; no other component talks to Docker directly

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{DeviceMapping, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ContainerDriver, ContainerSpec, ContainerState, DriverError, EngineState, ExecOutcome,
    LabeledContainer, Result, MANAGED_LABEL, SANDBOX_ID_LABEL,
};
use async_trait::async_trait;

/// Unprivileged account commands run as inside every sandbox image.
const EXEC_USER: &str = "agent";

pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    /// Connect using the environment's engine socket (DOCKER_HOST or the
    /// platform default). The connection is lazy; [`DockerDriver::ping`]
    /// verifies the daemon is actually reachable.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| DriverError::EngineUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DriverError::EngineUnavailable(e.to_string()))
    }

    fn to_bollard_config(&self, spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            cpu_period: Some(100_000),
            cpu_quota: Some((spec.cpu_limit * 100_000.0) as i64),
            memory: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            // The cold tier is a FUSE projection; the guest needs the device
            // and SYS_ADMIN to mount it.
            cap_add: Some(vec!["SYS_ADMIN".to_string()]),
            cap_drop: Some(vec!["NET_RAW".to_string()]),
            devices: Some(vec![DeviceMapping {
                path_on_host: Some("/dev/fuse".to_string()),
                path_in_container: Some("/dev/fuse".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }]),
            network_mode: Some(spec.network.clone()),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn convert_state(state: &str) -> EngineState {
        match state.to_lowercase().as_str() {
            "created" => EngineState::Created,
            "running" => EngineState::Running,
            "paused" => EngineState::Paused,
            "restarting" => EngineState::Restarting,
            "removing" => EngineState::Removing,
            "exited" => EngineState::Exited,
            "dead" => EngineState::Dead,
            _ => EngineState::Unknown,
        }
    }

    fn map_engine_err(container_id: &str, e: bollard::errors::Error) -> DriverError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => DriverError::NotFound(container_id.to_string()),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => DriverError::Engine(format!("engine returned {status_code}: {message}")),
            other => DriverError::Engine(other.to_string()),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "creating container");

        let config = self.to_bollard_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        match self.client.create_container(Some(options), config).await {
            Ok(created) => {
                debug!(container_id = %created.id, "created container");
                Ok(created.id)
            }
            Err(e) => {
                // Never leave a half-created container behind a failed create.
                let _ = self
                    .client
                    .remove_container(
                        &spec.name,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                Err(Self::map_engine_err(&spec.name, e))
            }
        }
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        info!(%container_id, "starting container");
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_engine_err(container_id, e))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        let inspect = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_engine_err(container_id, e))?;

        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.as_ref())
            .unwrap_or("unknown");

        let started_at = state
            .and_then(|s| s.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(ContainerState {
            state: Self::convert_state(status),
            exit_code: state.and_then(|s| s.exit_code),
            started_at,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        cwd: Option<&str>,
        deadline: Duration,
    ) -> Result<ExecOutcome> {
        let state = self.inspect(container_id).await?;
        if state.state != EngineState::Running {
            return Err(DriverError::NotRunning {
                container_id: container_id.to_string(),
                state: state.state.as_str().to_string(),
            });
        }

        debug!(%container_id, argv0 = %command.first().map(String::as_str).unwrap_or(""), "exec");

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    user: Some(EXEC_USER.to_string()),
                    working_dir: cwd.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_engine_err(container_id, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Self::map_engine_err(container_id, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match started {
            StartExecResults::Attached { mut output, .. } => {
                let drain = async {
                    while let Some(msg) = output.next().await {
                        match msg {
                            Ok(LogOutput::StdOut { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                stderr.extend_from_slice(&message)
                            }
                            Ok(LogOutput::Console { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(_) => {}
                            Err(e) => {
                                return Err(Self::map_engine_err(container_id, e));
                            }
                        }
                    }
                    Ok(())
                };

                // Hard wall-clock cut-off. On timeout the exec is abandoned
                // and the container is left running.
                match tokio::time::timeout(deadline, drain).await {
                    Ok(result) => result?,
                    Err(_) => return Err(DriverError::Timeout(deadline)),
                }
            }
            StartExecResults::Detached => {
                return Err(DriverError::Engine(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Self::map_engine_err(container_id, e))?;

        Ok(ExecOutcome {
            exit_code: exec_inspect.exit_code.unwrap_or(0),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()> {
        info!(%container_id, timeout_secs = timeout.as_secs(), "stopping container");

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone or already stopped both count as success.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => {
                warn!(%container_id, "container already gone during stop");
                Ok(())
            }
            Err(e) => Err(Self::map_engine_err(container_id, e)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        info!(%container_id, "removing container");

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Self::map_engine_err(container_id, e)),
        }
    }

    async fn list_by_label(&self, label: &str, value: &str) -> Result<Vec<LabeledContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label}={value}")]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let container_id = c.id?;
                let sandbox_id = c
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(SANDBOX_ID_LABEL))
                    .cloned();
                let state = c
                    .state
                    .as_deref()
                    .map(Self::convert_state)
                    .unwrap_or(EngineState::Unknown);
                Some(LabeledContainer {
                    container_id,
                    sandbox_id,
                    state,
                })
            })
            .collect())
    }
}
