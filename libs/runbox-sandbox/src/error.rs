//! Failure taxonomy of the sandbox. Every variant folds into an
//! [`ExecutionResult`] at the executor boundary; none of them crash a caller.

use runbox_common::types::{ExecutionResult, TIMEOUT_EXIT_CODE};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// No run command could be resolved for the language
    #[error("Language '{0}' is not supported.")]
    UnsupportedLanguage(String),

    /// A file name escapes the workspace root
    #[error("Invalid file path '{0}': must stay inside the workspace")]
    InvalidPath(String),

    /// Build step exited non-zero; its own result is what the caller sees
    #[error("Build failed with exit code {}", .0.exit_code)]
    BuildFailure(ExecutionResult),

    /// Container runtime or toolchain could not be reached or set up
    #[error("Runner unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Payload missing required fields
    #[error("Malformed job: {0}")]
    MalformedJob(String),

    /// Host filesystem failure while materializing or archiving a workspace
    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl SandboxError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SandboxError::BuildFailure(result) => result.exit_code,
            SandboxError::Timeout(_) => TIMEOUT_EXIT_CODE,
            _ => 1,
        }
    }

    /// Errors the dispatcher must not retry: the same payload would fail again.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SandboxError::UnsupportedLanguage(_)
                | SandboxError::InvalidPath(_)
                | SandboxError::MalformedJob(_)
        )
    }

    pub fn into_result(self) -> ExecutionResult {
        match self {
            SandboxError::BuildFailure(result) => result,
            SandboxError::Timeout(_) => ExecutionResult::timeout(self.to_string()),
            other => ExecutionResult::failure(other.exit_code(), other.to_string()),
        }
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_language_result() {
        let result = SandboxError::UnsupportedLanguage("cobol".into()).into_result();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output(), "Language 'cobol' is not supported.");
    }

    #[test]
    fn test_build_failure_passes_through() {
        let build = ExecutionResult::new(2, "", "syntax error");
        let result = SandboxError::BuildFailure(build.clone()).into_result();
        assert_eq!(result, build);
    }

    #[test]
    fn test_timeout_result() {
        let result = SandboxError::Timeout(Duration::from_millis(1500)).into_result();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.timed_out);
        assert!(result.stderr.contains("timed out after 1.5s"));
    }

    #[test]
    fn test_client_errors() {
        assert!(SandboxError::InvalidPath("../x".into()).is_client_error());
        assert!(!SandboxError::BackendUnavailable("down".into()).is_client_error());
    }
}
