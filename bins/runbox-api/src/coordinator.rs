/// Run Coordinator - API-side owner of run records
///
/// **Lifecycle:** queued → (running) → completed | failed
///
/// - A record is created `queued` before dispatch and reaches a terminal
///   status exactly once, when the execution path returns, even if the
///   submitting caller has gone away
/// - Only the run's own task writes to its record
/// - Storage and dispatch are both injected, so the in-memory store and the
///   queue/inline choice stay configuration concerns

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use runbox_common::redis as job_queue;
use runbox_common::types::{ExecutionResult, JobEnvelope, RunRecord, RunRequest, RunStatus};
use runbox_sandbox::{validate_request, SandboxError, SandboxExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, Instrument};
use uuid::Uuid;

use crate::metrics;

pub const MAX_RECENT_RUNS: usize = 50;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> Option<RunRecord>;
    async fn put(&self, record: RunRecord);
    /// Most recent first by `started_at`.
    async fn list_recent(&self, limit: usize) -> Vec<RunRecord>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    records: RwLock<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, id: &Uuid) -> Option<RunRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn put(&self, record: RunRecord) {
        self.records.write().await.insert(record.id, record);
    }

    async fn list_recent(&self, limit: usize) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        records
    }
}

/// Hands a run to whatever executes it and waits for the result.
#[async_trait]
pub trait RunDispatch: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(&self, id: Uuid, request: &RunRequest) -> anyhow::Result<ExecutionResult>;

    /// Inline execution starts immediately, so the record moves to `running`.
    fn executes_inline(&self) -> bool {
        false
    }
}

/// Degraded/standalone mode: calls the Sandbox Executor in-process.
pub struct InlineDispatch {
    executor: Arc<SandboxExecutor>,
}

impl InlineDispatch {
    pub fn new(executor: Arc<SandboxExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl RunDispatch for InlineDispatch {
    fn name(&self) -> &str {
        "inline"
    }

    async fn dispatch(&self, _id: Uuid, request: &RunRequest) -> anyhow::Result<ExecutionResult> {
        Ok(self.executor.run(request).await)
    }

    fn executes_inline(&self) -> bool {
        true
    }
}

/// Production mode: enqueue for a worker and block on its reply.
pub struct QueueDispatch {
    client: redis::Client,
    conn: ConnectionManager,
    queue_name: String,
    reply_timeout: Duration,
}

impl QueueDispatch {
    pub fn new(client: redis::Client, conn: ConnectionManager, queue_name: String, reply_timeout: Duration) -> Self {
        Self {
            client,
            conn,
            queue_name,
            reply_timeout,
        }
    }
}

#[async_trait]
impl RunDispatch for QueueDispatch {
    fn name(&self) -> &str {
        "queue"
    }

    async fn dispatch(&self, id: Uuid, request: &RunRequest) -> anyhow::Result<ExecutionResult> {
        let job = JobEnvelope {
            id,
            request: request.clone(),
        };
        let mut conn = self.conn.clone();

        match job_queue::submit_and_wait(&self.client, &mut conn, &self.queue_name, &job, self.reply_timeout).await? {
            Some(reply) => Ok(reply.result),
            None => anyhow::bail!(
                "no worker reply within {}s",
                self.reply_timeout.as_secs()
            ),
        }
    }
}

async fn finish_run(
    store: Arc<dyn RunStore>,
    dispatch: Arc<dyn RunDispatch>,
    request: RunRequest,
    mut record: RunRecord,
) -> RunRecord {
    let result = match dispatch.dispatch(record.id, &request).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Dispatch failed");
            ExecutionResult::failure(1, format!("Dispatch failed: {}", e))
        }
    };

    record.complete(&result, Utc::now());
    store.put(record.clone()).await;
    metrics::observe_run(&record);

    info!(
        status = %record.status,
        exit_code = result.exit_code,
        runtime_ms = record.runtime_ms,
        "Run finished"
    );
    record
}

pub struct RunCoordinator {
    store: Arc<dyn RunStore>,
    dispatch: Arc<dyn RunDispatch>,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn RunStore>, dispatch: Arc<dyn RunDispatch>) -> Self {
        Self { store, dispatch }
    }

    pub fn dispatch_mode(&self) -> &str {
        self.dispatch.name()
    }

    /// Record, dispatch, and fold the result into a terminal record.
    ///
    /// Dispatch and completion run on their own task, so dropping this future
    /// does not leave the record `queued` or `running`. Only request
    /// validation errors are returned; execution and transport failures end
    /// up in a `failed` record.
    #[instrument(skip(self, request), fields(run_id, language = %request.language, mode = self.dispatch.name()))]
    pub async fn create(&self, request: RunRequest) -> Result<RunRecord, SandboxError> {
        validate_request(&request)?;

        let id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(id));

        let mut record = RunRecord::queued(id, &request, Utc::now());
        self.store.put(record.clone()).await;
        info!("Run queued");

        if self.dispatch.executes_inline() {
            record.status = RunStatus::Running;
            self.store.put(record.clone()).await;
        }

        let store = Arc::clone(&self.store);
        let dispatch = Arc::clone(&self.dispatch);
        let pending = record.clone();
        let completion = tokio::spawn(
            async move { finish_run(store, dispatch, request, pending).await }.instrument(tracing::Span::current()),
        );

        // Awaited here, but the record still reaches a terminal status if the
        // caller goes away first.
        match completion.await {
            Ok(record) => Ok(record),
            Err(e) => {
                error!(error = %e, "Run task aborted");
                record.complete(&ExecutionResult::failure(1, format!("Run task aborted: {}", e)), Utc::now());
                self.store.put(record.clone()).await;
                metrics::observe_run(&record);
                Ok(record)
            }
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<RunRecord> {
        self.store.get(id).await
    }

    pub async fn list_recent(&self, limit: usize) -> Vec<RunRecord> {
        self.store.list_recent(limit.min(MAX_RECENT_RUNS)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use runbox_common::types::RunFile;
    use runbox_sandbox::{DirectBackend, LanguageProfiles};

    fn inline_coordinator() -> RunCoordinator {
        let executor = SandboxExecutor::new(
            Arc::new(DirectBackend::new()),
            Arc::new(LanguageProfiles::builtin()),
            Duration::from_secs(5),
        );
        RunCoordinator::new(
            Arc::new(InMemoryRunStore::new()),
            Arc::new(InlineDispatch::new(Arc::new(executor))),
        )
    }

    fn shell(run_cmd: &str) -> RunRequest {
        RunRequest::new("shell", vec![RunFile::new("input.txt", "data")]).with_run_cmd(run_cmd)
    }

    struct FailingDispatch;

    #[async_trait]
    impl RunDispatch for FailingDispatch {
        fn name(&self) -> &str {
            "failing"
        }

        async fn dispatch(&self, _id: Uuid, _request: &RunRequest) -> anyhow::Result<ExecutionResult> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let coordinator = inline_coordinator();
        let record = coordinator.create(shell("exit 7")).await.unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.is_some());
        assert!(record.finished_at.is_some());
        assert!(record.runtime_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_success_marks_completed() {
        let coordinator = inline_coordinator();
        let record = coordinator.create(shell("cat input.txt")).await.unwrap();

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.output, "data");
        assert!(record.error.is_none());

        let stored = coordinator.get(&record.id).await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_record() {
        let coordinator = inline_coordinator();
        let traversal = RunRequest::new("shell", vec![RunFile::new("../escape.txt", "x")]).with_run_cmd("true");

        let err = coordinator.create(traversal).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath(_)));
        assert!(err.is_client_error());
        assert!(coordinator.list_recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_language_is_failed_run() {
        let coordinator = inline_coordinator();
        let request = RunRequest::new("cobol", vec![RunFile::new("MAIN.cbl", "")]);

        let record = coordinator.create(request).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_recorded() {
        let coordinator = RunCoordinator::new(Arc::new(InMemoryRunStore::new()), Arc::new(FailingDispatch));

        let record = coordinator.create(shell("true")).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_dropped_caller_still_completes_record() {
        let coordinator = inline_coordinator();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            coordinator.create(shell("sleep 1; echo done")),
        )
        .await;
        assert!(abandoned.is_err());

        let pending = coordinator.list_recent(1).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, RunStatus::Running);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let record = coordinator.get(&pending[0].id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.output, "done");
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_list_recent_ordered_and_capped() {
        let store = InMemoryRunStore::new();
        let base = Utc::now();
        let request = shell("true");

        for i in 0..60 {
            let record = RunRecord::queued(Uuid::new_v4(), &request, base + ChronoDuration::seconds(i));
            store.put(record).await;
        }

        let coordinator = RunCoordinator::new(Arc::new(store), Arc::new(FailingDispatch));
        let recent = coordinator.list_recent(100).await;

        assert_eq!(recent.len(), MAX_RECENT_RUNS);
        assert_eq!(recent[0].started_at, base + ChronoDuration::seconds(59));
        assert!(recent.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        assert_eq!(coordinator.list_recent(3).await.len(), 3);
    }
}
