//! Host subprocess execution
//!
//! Commands run through `/bin/sh -c` in the workspace with the host
//! environment plus overrides. There is no CPU, memory, or network isolation:
//! this backend is for development only.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::output::read_capped;
use super::{Backend, ExecutionContext};
use crate::config::DEFAULT_OUTPUT_LIMIT;
use crate::error::{Result, SandboxError};
use runbox_common::types::ExecutionResult;

/// SIGKILLs a whole process group on drop so background children of the
/// shell die with it, whether the command finished, failed, or timed out.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            // ESRCH just means everything already exited
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

#[derive(Debug)]
pub struct DirectBackend {
    output_limit: usize,
}

impl Default for DirectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectBackend {
    pub fn new() -> Self {
        Self::with_output_limit(DEFAULT_OUTPUT_LIMIT)
    }

    /// Keep at most `limit` bytes of each of stdout and stderr
    pub fn with_output_limit(limit: usize) -> Self {
        Self { output_limit: limit }
    }

    async fn run_shell(
        &self,
        script: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
        deadline: Instant,
        timeout: std::time::Duration,
    ) -> Result<ExecutionResult> {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::BackendUnavailable(format!("failed to spawn shell: {}", e)))?;

        let _group = ProcessGroupGuard {
            pgid: child.id().map(|pid| Pid::from_raw(pid as i32)),
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SandboxError::BackendUnavailable("child pipes were not captured".to_string()));
        };

        let collect = async {
            tokio::try_join!(
                read_capped(stdout, self.output_limit),
                read_capped(stderr, self.output_limit),
                child.wait(),
            )
        };

        match tokio::time::timeout_at(deadline, collect).await {
            Ok(Ok((stdout, stderr, status))) => {
                let truncated = stdout.truncated() || stderr.truncated();
                if truncated {
                    warn!(limit = self.output_limit, "Output exceeded capture limit, truncated");
                }
                Ok(ExecutionResult {
                    truncated,
                    ..ExecutionResult::new(exit_code(status), stdout.into_string(), stderr.into_string())
                })
            }
            Ok(Err(e)) => Err(SandboxError::BackendUnavailable(format!("process error: {}", e))),
            Err(_) => {
                warn!(script = %script, "Command exceeded deadline, killing process group");
                Err(SandboxError::Timeout(timeout))
            }
        }
    }
}

/// Signal deaths map to 128 + signo like a shell reports them.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}

#[async_trait]
impl Backend for DirectBackend {
    fn name(&self) -> &str {
        "direct"
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult> {
        let workdir = ctx.workspace.root();
        let timeout = ctx.deadline.saturating_duration_since(Instant::now());

        if let Some(build) = &ctx.plan.build_cmd {
            debug!(language = ctx.language, "Running build step");
            let build_result = self.run_shell(build, workdir, &ctx.plan.env, ctx.deadline, timeout).await?;
            if !build_result.success() {
                return Err(SandboxError::BuildFailure(build_result));
            }
        }

        debug!(language = ctx.language, "Running run step");
        self.run_shell(&ctx.plan.run_cmd, workdir, &ctx.plan.env, ctx.deadline, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandPlan;
    use crate::workspace::Workspace;
    use runbox_common::types::RunFile;
    use std::time::Duration;

    fn plan(build: Option<&str>, run: &str) -> CommandPlan {
        CommandPlan {
            build_cmd: build.map(str::to_string),
            run_cmd: run.to_string(),
            env: HashMap::new(),
        }
    }

    async fn execute(workspace: &Workspace, plan: &CommandPlan, timeout: Duration) -> Result<ExecutionResult> {
        let ctx = ExecutionContext {
            workspace,
            language: "sh",
            profile: None,
            plan,
            deadline: Instant::now() + timeout,
        };
        DirectBackend::new().execute(&ctx).await
    }

    #[tokio::test]
    async fn test_streams_are_separate() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(None, "echo out; echo err 1>&2; exit 3");

        let result = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_runs_in_workspace_root() {
        let workspace = Workspace::materialize(&[RunFile::new("data/input.txt", "payload")]).unwrap();
        let plan = plan(None, "cat data/input.txt");

        let result = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout, "payload");
    }

    #[tokio::test]
    async fn test_failed_build_skips_run() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(Some("echo broken 1>&2; exit 2"), "touch ran.marker");

        let err = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap_err();
        match err {
            SandboxError::BuildFailure(result) => {
                assert_eq!(result.exit_code, 2);
                assert_eq!(result.stderr.trim(), "broken");
            }
            other => panic!("expected build failure, got {:?}", other),
        }
        assert!(!workspace.root().join("ran.marker").exists());
    }

    #[tokio::test]
    async fn test_build_side_effects_visible_to_run() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(Some("echo built > artifact"), "cat artifact");

        let result = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout.trim(), "built");
    }

    #[tokio::test]
    async fn test_env_overrides_applied() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let mut plan = plan(None, "printf '%s' \"$GREETING\"");
        plan.env.insert("GREETING".into(), "hello".into());

        let result = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(None, "sleep 30 & sleep 30");

        let started = std::time::Instant::now();
        let err = execute(&workspace, &plan, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_large_output_capped() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(None, "head -c 20000000 /dev/zero | tr '\\0' a; echo tail 1>&2");
        let ctx = ExecutionContext {
            workspace: &workspace,
            language: "sh",
            profile: None,
            plan: &plan,
            deadline: Instant::now() + Duration::from_secs(20),
        };

        let result = DirectBackend::with_output_limit(4096).execute(&ctx).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 4096);
        assert!(result.stdout.chars().all(|c| c == 'a'));
        assert_eq!(result.stderr, "tail\n");
    }

    #[tokio::test]
    async fn test_small_output_not_marked_truncated() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let result = execute(&workspace, &plan(None, "echo ok"), Duration::from_secs(5)).await.unwrap();
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let workspace = Workspace::materialize(&[RunFile::new("a.txt", "x")]).unwrap();
        let plan = plan(None, "kill -9 $$");

        let result = execute(&workspace, &plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 137);
    }
}
