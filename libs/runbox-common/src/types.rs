use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Exit code reported when a run exceeds its wall-clock bound (same as coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A single source file of a submission. `name` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFile {
    pub name: String,
    pub content: String,
}

impl RunFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Inbound run request. Missing `language`/`files` decode as empty so the
/// dispatcher can report them instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub files: Vec<RunFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

impl RunRequest {
    pub fn new(language: impl Into<String>, files: Vec<RunFile>) -> Self {
        Self {
            language: language.into(),
            files,
            ..Default::default()
        }
    }

    pub fn with_build_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.build_cmd = Some(cmd.into());
        self
    }

    pub fn with_run_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.run_cmd = Some(cmd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Captured outcome of one sandboxed execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
    /// Set when stdout or stderr hit the capture limit and was cut short
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
            truncated: false,
        }
    }

    /// Failure that never reached a user process; the message goes to stderr.
    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        Self::new(exit_code, String::new(), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(TIMEOUT_EXIT_CODE, message)
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Display form: trimmed stdout, followed by trimmed stderr on its own line
    /// when both are present; stderr alone when stdout is blank.
    pub fn output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();

        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }

    /// Human-readable error for a failed run, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            Some(format!("process exited with code {}", self.exit_code))
        } else {
            Some(stderr.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Coordinator-owned record of a run; also the outbound RunResult shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub status: RunStatus,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runtime_ms: Option<i64>,
    pub output: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
}

impl RunRecord {
    pub fn queued(id: Uuid, request: &RunRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Queued,
            language: request.language.clone(),
            started_at,
            finished_at: None,
            runtime_ms: None,
            output: String::new(),
            error: None,
            project_slug: request.project_slug.clone(),
        }
    }

    /// Folds a backend result into the record. Returns `false` without touching
    /// anything if the record already reached a terminal status.
    pub fn complete(&mut self, result: &ExecutionResult, finished_at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finished_at = Some(finished_at);
        self.runtime_ms = Some((finished_at - self.started_at).num_milliseconds());
        self.status = if result.success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.output = result.output();
        self.error = result.error_message();
        true
    }
}

/// Queue message: a run request keyed by the run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub request: RunRequest,
}

/// Worker reply associated with the job's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReply {
    pub id: Uuid,
    pub output: String,
    pub result: ExecutionResult,
}

impl JobReply {
    pub fn new(id: Uuid, result: ExecutionResult) -> Self {
        Self {
            id,
            output: result.output(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_output_stdout_only() {
        let result = ExecutionResult::new(0, "OK\n", "");
        assert_eq!(result.output(), "OK");
    }

    #[test]
    fn test_output_stderr_only() {
        let result = ExecutionResult::new(1, "", "err\n");
        assert_eq!(result.output(), "err");
    }

    #[test]
    fn test_output_both_streams() {
        let result = ExecutionResult::new(0, "OK\n", "warn\n");
        assert_eq!(result.output(), "OK\nwarn");
    }

    #[test]
    fn test_output_whitespace_only_stdout() {
        let result = ExecutionResult::new(0, "  \n", "warn");
        assert_eq!(result.output(), "warn");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(ExecutionResult::new(0, "hi", "noise").error_message(), None);
        assert_eq!(
            ExecutionResult::new(7, "", "").error_message().as_deref(),
            Some("process exited with code 7")
        );
        assert_eq!(
            ExecutionResult::new(2, "", "boom\n").error_message().as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_request_missing_fields_decode_empty() {
        let request: RunRequest = serde_json::from_str(r#"{"run_cmd": "ls"}"#).unwrap();
        assert!(request.language.is_empty());
        assert!(request.files.is_empty());
        assert_eq!(request.run_cmd.as_deref(), Some("ls"));
    }

    #[test]
    fn test_envelope_is_flat() {
        let envelope = JobEnvelope {
            id: Uuid::new_v4(),
            request: RunRequest::new("python", vec![RunFile::new("Main.py", "print(1)")]),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["language"], "python");
        assert_eq!(value["files"][0]["name"], "Main.py");
        assert!(value.get("build_cmd").is_none());
    }

    #[test]
    fn test_record_completes_once() {
        let request = RunRequest::new("python", vec![RunFile::new("Main.py", "")]);
        let started = Utc::now();
        let mut record = RunRecord::queued(Uuid::new_v4(), &request, started);

        let finished = started + Duration::milliseconds(250);
        assert!(record.complete(&ExecutionResult::new(7, "", ""), finished));
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.runtime_ms, Some(250));
        assert!(record.error.is_some());

        let later = finished + Duration::seconds(1);
        assert!(!record.complete(&ExecutionResult::new(0, "ok", ""), later));
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.finished_at, Some(finished));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(RunStatus::Queued.to_string(), "queued");
    }
}
