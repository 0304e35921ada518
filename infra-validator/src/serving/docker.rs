//! TensorFlow Serving in a local docker container
//!
//! The container is driven through the `docker` CLI. The model base directory
//! (the parent of the versioned model directory) is bind-mounted read-only and
//! the REST port is published on a free loopback port.

use super::{Deadline, ModelServerRunner, RunnerState, ServerEndpoint, ServingBinary};
use crate::config::LocalDockerConfig;
use crate::error::{ValidatorError, ValidatorResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// REST API port of TensorFlow Serving inside the container
pub const REST_PORT: u16 = 8501;
const CONTAINER_MODEL_BASE: &str = "/model";
const LOOPBACK: &str = "127.0.0.1";

pub struct LocalDockerRunner {
    docker: LocalDockerConfig,
    image: String,
    model_name: String,
    model_base_path: PathBuf,
    container_name: String,
    host_port: Option<u16>,
    container_id: Option<String>,
    /// `docker run` was issued, so a container may exist under our name
    run_issued: bool,
    state: RunnerState,
}

impl LocalDockerRunner {
    /// Create a runner serving `model_path`, a numeric version directory
    pub fn new(binary: &ServingBinary, model_path: &Path, unique_id: &str) -> ValidatorResult<Self> {
        let ServingBinary::TensorFlowServing {
            model_name,
            image,
            docker,
        } = binary
        else {
            return Err(ValidatorError::runner(format!(
                "{binary} cannot run in a docker container"
            )));
        };

        let model_base_path = model_path
            .parent()
            .ok_or_else(|| {
                ValidatorError::runner(format!(
                    "Model path has no base directory: {}",
                    model_path.display()
                ))
            })?
            .to_path_buf();

        Ok(Self {
            docker: docker.clone(),
            image: image.clone(),
            model_name: model_name.clone(),
            model_base_path,
            container_name: format!("infra-validator-{model_name}-{unique_id}"),
            host_port: None,
            container_id: None,
            run_issued: false,
            state: RunnerState::Created,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    fn run_args(&self, host_port: u16) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "--publish".to_string(),
            format!("{LOOPBACK}:{host_port}:{REST_PORT}"),
            "--mount".to_string(),
            format!(
                "type=bind,source={},target={CONTAINER_MODEL_BASE}/{},readonly",
                self.model_base_path.display(),
                self.model_name
            ),
            "--env".to_string(),
            format!("MODEL_NAME={}", self.model_name),
            "--env".to_string(),
            format!("MODEL_BASE_PATH={CONTAINER_MODEL_BASE}"),
        ];
        if let Some(network) = &self.docker.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.push(self.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> ValidatorResult<String> {
        let output = Command::new(&self.docker.docker_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ValidatorError::runner(format!("Failed to invoke {}: {e}", self.docker.docker_path))
            })?;

        if !output.status.success() {
            return Err(ValidatorError::runner(format!(
                "docker {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Container to remove on release: the id reported by `docker run`, or
    /// our container name when `run` failed after possibly creating it
    fn removal_target(&mut self) -> Option<String> {
        let issued = std::mem::take(&mut self.run_issued);
        self.container_id
            .take()
            .or_else(|| issued.then(|| self.container_name.clone()))
    }

    async fn container_status(&self, container_id: &str) -> ValidatorResult<String> {
        self.docker(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            container_id.to_string(),
        ])
        .await
    }
}

#[async_trait]
impl ModelServerRunner for LocalDockerRunner {
    async fn start(&mut self) -> ValidatorResult<()> {
        if self.state != RunnerState::Created {
            return Err(ValidatorError::runner(format!(
                "Runner {} already started",
                self.container_name
            )));
        }
        let host_port = pick_free_port()?;
        info!(
            "Starting {} as container {} on port {host_port}",
            self.image, self.container_name
        );
        self.run_issued = true;
        let container_id = self.docker(&self.run_args(host_port)).await?;
        self.host_port = Some(host_port);
        self.container_id = Some(container_id);
        self.state = RunnerState::Starting;
        Ok(())
    }

    async fn wait_until_running(&mut self, timeout: Duration) -> ValidatorResult<()> {
        let container_id = self.container_id.clone().ok_or_else(|| {
            ValidatorError::runner(format!("Container {} not started", self.container_name))
        })?;
        let deadline = Deadline::after(timeout);

        loop {
            let status = self.container_status(&container_id).await?;
            debug!("Container {} is {status}", self.container_name);
            match status.as_str() {
                "running" => {
                    self.state = RunnerState::Running;
                    return Ok(());
                }
                "exited" | "dead" => {
                    return Err(ValidatorError::runner(format!(
                        "Container {} is {status}",
                        self.container_name
                    )));
                }
                _ => {}
            }

            let Some(delay) = deadline.next_poll() else {
                return Err(ValidatorError::timeout(
                    format!("container {} to run", self.container_name),
                    timeout,
                ));
            };
            tokio::time::sleep(delay).await;
        }
    }

    fn endpoint(&self) -> ValidatorResult<ServerEndpoint> {
        match (self.state, self.host_port) {
            (RunnerState::Running, Some(port)) => Ok(ServerEndpoint::Http {
                host: LOOPBACK.to_string(),
                port,
            }),
            _ => Err(ValidatorError::runner(format!(
                "Container {} is not running",
                self.container_name
            ))),
        }
    }

    async fn stop(&mut self) -> ValidatorResult<()> {
        self.state = RunnerState::Stopped;
        let Some(target) = self.removal_target() else {
            return Ok(());
        };
        info!("Stopping container {}", self.container_name);
        self.docker(&["rm".to_string(), "--force".to_string(), target])
            .await
            .map(|_| ())
    }
}

impl Drop for LocalDockerRunner {
    fn drop(&mut self) {
        let Some(target) = self.removal_target() else {
            return;
        };
        warn!(
            "Container {} dropped without stop, removing it",
            self.container_name
        );
        match std::process::Command::new(&self.docker.docker_path)
            .args(["rm", "--force", target.as_str()])
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "Failed to remove container {} ({}): {}",
                self.container_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!(
                "Failed to invoke {} to remove container {}: {e}",
                self.docker.docker_path, self.container_name
            ),
        }
    }
}

fn pick_free_port() -> ValidatorResult<u16> {
    let listener = TcpListener::bind((LOOPBACK, 0))?;
    Ok(listener.local_addr()?.port())
}
