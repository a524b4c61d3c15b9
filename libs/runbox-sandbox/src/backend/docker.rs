//! Container-isolated execution using Bollard
//!
//! **Per-run container rules:**
//! 1. Image comes from the language profile, or the default image if unmapped
//! 2. Network disabled; memory, CPU share, and PID count bounded
//! 3. Idle `/bin/sh` entrypoint kept alive by an open stdin so it can take execs
//! 4. Workspace injected as a tar archive at `/workspace`
//! 5. Build and run execute as one `sh -c` joined with `&&`
//! 6. Container force-removed on every exit path

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::output::CappedOutput;
use super::{Backend, ExecutionContext};
use crate::config::{ResourceLimits, SandboxSettings};
use crate::error::{Result, SandboxError};
use runbox_common::types::ExecutionResult;

const WORKSPACE_DIR: &str = "/workspace";
const MANAGED_LABEL: &str = "runbox.managed";

/// Guarantees container removal. The normal path awaits [`ContainerGuard::remove`];
/// if the run future is dropped first (outer timeout, cancellation) removal is
/// spawned from `Drop`.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        remove_container(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&docker, &container_id).await;
                });
            }
            Err(_) => warn!(container_id = %container_id, "No runtime to remove container on drop"),
        }
    }
}

/// Force-remove a container. Already-gone containers are not an error.
async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    match docker.remove_container(container_id, Some(options)).await {
        Ok(()) => debug!(container_id = %container_id, "Container removed"),
        Err(e) if is_gone(&e) => debug!(container_id = %container_id, "Container already removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
    }
}

/// 404: no such container. 409: removal already in progress.
fn is_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

pub struct DockerBackend {
    docker: Docker,
    limits: ResourceLimits,
    default_image: String,
}

impl DockerBackend {
    /// Build a client from the local defaults (honours `DOCKER_HOST`). The
    /// daemon is not contacted until the first run.
    pub fn connect(settings: &SandboxSettings) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::BackendUnavailable(format!("failed to connect to Docker daemon: {}", e)))?;

        Ok(Self {
            docker,
            limits: settings.limits.clone(),
            default_image: settings.default_image.clone(),
        })
    }

    fn image_for(&self, ctx: &ExecutionContext<'_>) -> String {
        ctx.profile
            .map(|profile| profile.image.clone())
            .unwrap_or_else(|| self.default_image.clone())
    }

    /// Pull the image if it is not cached locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                SandboxError::BackendUnavailable(format!("failed to pull image '{}': {}", image, e))
            })?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, image: &str) -> Result<String> {
        let container_name = format!("runbox-{}", uuid::Uuid::new_v4());

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["/bin/sh".to_string()]),
            entrypoint: Some(vec![]),
            tty: Some(true),
            open_stdin: Some(true),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(self.limits.memory_bytes),
                memory_swap: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus()),
                pids_limit: Some(self.limits.pids_limit),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("failed to create container: {}", e)))?;

        Ok(container.id)
    }

    /// Start the container, inject the workspace, and run the joined command
    /// under the run's deadline.
    async fn run_in_container(&self, container_id: &str, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("failed to start container: {}", e)))?;

        let archive = ctx.workspace.archive(WORKSPACE_DIR.trim_start_matches('/'))?;
        let upload = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(upload), archive.into())
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("failed to inject workspace: {}", e)))?;

        let script = ctx.plan.joined(WORKSPACE_DIR);
        let env: Vec<String> = ctx.plan.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let timeout = ctx.deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout_at(ctx.deadline, self.exec_script(container_id, script, env)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(container_id = %container_id, "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    if !is_gone(&e) {
                        warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                    }
                }
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    /// Run one shell line and collect demultiplexed stdout/stderr plus the
    /// exec's own exit code.
    async fn exec_script(&self, container_id: &str, script: String, env: Vec<String>) -> Result<ExecutionResult> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            env: Some(env),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let mut stdout = CappedOutput::new(self.limits.output_limit_bytes);
        let mut stderr = CappedOutput::new(self.limits.output_limit_bytes);

        match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } => stdout.push(&message),
                        LogOutput::StdErr { message } => stderr.push(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::BackendUnavailable(
                    "exec started detached, no output to collect".to_string(),
                ));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = match inspect.exit_code {
            Some(code) => code as i32,
            None => {
                warn!(container_id = %container_id, "No exit code reported for exec");
                -1
            }
        };

        let truncated = stdout.truncated() || stderr.truncated();
        if truncated {
            warn!(container_id = %container_id, limit = self.limits.output_limit_bytes, "Output exceeded capture limit, truncated");
        }

        let mut stderr = stderr.into_string();
        // 137 from the container is the kernel OOM killer or SIGKILL
        if exit_code == 137 {
            stderr.push_str("\n[Process killed: likely exceeded memory limit]");
        }

        Ok(ExecutionResult {
            truncated,
            ..ExecutionResult::new(exit_code, stdout.into_string(), stderr)
        })
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("Docker daemon unreachable: {}", e)))?;

        let image = self.image_for(ctx);
        self.ensure_image(&image).await?;

        let container_id = self.create_container(&image).await?;
        let guard = ContainerGuard::new(&self.docker, container_id.clone());
        debug!(container_id = %container_id, image = %image, language = ctx.language, "Container created");

        let outcome = self.run_in_container(&container_id, ctx).await;
        guard.remove().await;

        outcome
    }
}

impl std::fmt::Debug for DockerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerBackend")
            .field("limits", &self.limits)
            .field("default_image", &self.default_image)
            .finish()
    }
}
