//! Execution backends: one implementation per isolation strategy behind
//! [`Backend`].
//!
//! - [`DirectBackend`] runs shell commands as host subprocesses
//! - [`DockerBackend`] runs them inside a throwaway, network-less container

mod direct;
mod docker;
mod output;

pub use direct::DirectBackend;
pub use docker::DockerBackend;

use crate::config::{BackendKind, SandboxSettings};
use crate::error::{Result, SandboxError};
use crate::profiles::LanguageProfile;
use crate::workspace::Workspace;
use async_trait::async_trait;
use runbox_common::types::{ExecutionResult, RunRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Commands and environment resolved for one run, independent of backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub build_cmd: Option<String>,
    pub run_cmd: String,
    /// Profile env overlaid with request env; the backend supplies the base.
    pub env: HashMap<String, String>,
}

impl CommandPlan {
    /// Explicit commands win over profile defaults. A blank run command counts
    /// as absent; an explicit blank build command disables the build. Without
    /// any run command the language is unsupported.
    pub fn resolve(request: &RunRequest, profile: Option<&LanguageProfile>) -> Result<Self> {
        let non_blank = |cmd: &Option<String>| {
            cmd.as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
        };

        let run_cmd = non_blank(&request.run_cmd)
            .or_else(|| profile.map(|p| p.run_cmd.clone()))
            .ok_or_else(|| SandboxError::UnsupportedLanguage(request.language.clone()))?;

        let build_cmd = match &request.build_cmd {
            Some(_) => non_blank(&request.build_cmd),
            None => profile.and_then(|p| non_blank(&p.build_cmd)),
        };

        let mut env = profile.map(|p| p.env.clone()).unwrap_or_default();
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(Self { build_cmd, run_cmd, env })
    }

    /// Single shell line for backends that run build and run in one
    /// invocation; `&&` makes a failing build skip the run.
    pub fn joined(&self, workdir: &str) -> String {
        let mut steps = vec![format!("cd {}", workdir)];
        if let Some(build) = &self.build_cmd {
            steps.push(build.clone());
        }
        steps.push(self.run_cmd.clone());
        steps.join(" && ")
    }
}

/// Everything a backend needs for one run
pub struct ExecutionContext<'a> {
    pub workspace: &'a Workspace,
    pub language: &'a str,
    pub profile: Option<&'a LanguageProfile>,
    pub plan: &'a CommandPlan,
    /// Wall-clock deadline for the whole run, build included
    pub deadline: Instant,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Run build (if any) then run. A non-zero exit is an `Ok` result; errors
    /// are reserved for infrastructure faults, failed builds, and timeouts.
    /// On deadline expiry the backend must kill what it started before returning.
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult>;
}

/// Build the backend selected by configuration
pub fn create_backend(settings: &SandboxSettings) -> Result<Arc<dyn Backend>> {
    match settings.backend {
        BackendKind::Direct => Ok(Arc::new(DirectBackend::with_output_limit(
            settings.limits.output_limit_bytes,
        ))),
        BackendKind::Docker => Ok(Arc::new(DockerBackend::connect(settings)?)),
    }
}
