/// Sandbox Executor - the single seam callers run code through
///
/// **Responsibility:**
/// Profile lookup, command resolution, workspace lifetime, and the wall-clock
/// bound around a backend. Which backend runs is decided at construction.
///
/// **Guarantees:**
/// - Never returns an error: every failure becomes an `ExecutionResult`
/// - Timeouts are always reported (exit 124), never silently dropped
/// - The workspace is torn down before the result is returned
/// - Unsupported languages short-circuit before any backend process starts

use crate::backend::{create_backend, Backend, CommandPlan, ExecutionContext};
use crate::config::SandboxSettings;
use crate::error::{Result, SandboxError};
use crate::profiles::LanguageProfiles;
use crate::workspace::{validate_request, Workspace};
use runbox_common::types::{ExecutionResult, RunRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Extra time granted past the run deadline for backends to kill and reclaim
/// what they started before the executor abandons them.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct SandboxExecutor {
    backend: Arc<dyn Backend>,
    profiles: Arc<LanguageProfiles>,
    timeout: Duration,
}

impl SandboxExecutor {
    pub fn new(backend: Arc<dyn Backend>, profiles: Arc<LanguageProfiles>, timeout: Duration) -> Self {
        Self {
            backend,
            profiles,
            timeout,
        }
    }

    /// Construct the configured backend and the builtin profile table with
    /// image overrides applied.
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self> {
        let backend = create_backend(settings)?;
        let profiles = LanguageProfiles::builtin().with_images(&settings.images);
        Ok(Self::new(backend, Arc::new(profiles), settings.timeout))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn profiles(&self) -> &LanguageProfiles {
        &self.profiles
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(
        skip(self, request),
        fields(language = %request.language, files = request.files.len(), backend = self.backend.name())
    )]
    pub async fn run(&self, request: &RunRequest) -> ExecutionResult {
        let start = std::time::Instant::now();

        let result = match self.try_run(request).await {
            Ok(result) => result,
            Err(e) => {
                if !matches!(e, SandboxError::BuildFailure(_)) {
                    warn!(error = %e, "Run did not complete normally");
                }
                e.into_result()
            }
        };

        info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = start.elapsed().as_millis() as u64,
            "Run finished"
        );
        result
    }

    async fn try_run(&self, request: &RunRequest) -> Result<ExecutionResult> {
        let profile = self.profiles.get(&request.language);
        let plan = CommandPlan::resolve(request, profile)?;
        validate_request(request)?;

        let mut workspace = Workspace::materialize(&request.files)?;

        let deadline = Instant::now() + self.timeout;
        let ctx = ExecutionContext {
            workspace: &workspace,
            language: &request.language,
            profile,
            plan: &plan,
            deadline,
        };

        let outcome = match tokio::time::timeout_at(deadline + TEARDOWN_GRACE, self.backend.execute(&ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Backend ignored its deadline, abandoning run");
                Err(SandboxError::Timeout(self.timeout))
            }
        };

        if let Err(e) = workspace.teardown() {
            warn!(error = %e, "Failed to remove workspace");
        }

        // Backends report the time left when they started; report the configured bound
        outcome.map_err(|e| match e {
            SandboxError::Timeout(_) => SandboxError::Timeout(self.timeout),
            other => other,
        })
    }
}
