/// Job Dispatcher - queue consumer around the Sandbox Executor
///
/// **Per-job lifecycle:** received → executing → reported
///
/// - A job is claimed into this worker's processing list, never popped outright
/// - It is acknowledged only after its reply is written, so a crash mid-run
///   leaves it for redelivery (at-least-once); every run gets a fresh
///   workspace, which makes re-execution safe
/// - Malformed payloads are answered with a failed result at once and
///   acknowledged; they are never retried
/// - Shutdown stops claiming but never abandons a claim already in flight;
///   claimed jobs are run and reported before the worker exits
/// - Timeouts and cancellation of the run itself are the executor's job

use crate::config::WorkerSettings;
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use runbox_common::redis as job_queue;
use runbox_common::types::{JobReply, RunRequest};
use runbox_sandbox::{validate_request, SandboxError, SandboxExecutor};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const REPLY_ATTEMPTS: u32 = 3;

/// Decode a raw queue payload and run it.
///
/// Returns `None` only when the payload carries no usable job id, since there
/// is then nowhere to send a reply.
pub async fn handle_payload(executor: &SandboxExecutor, payload: &str) -> Option<JobReply> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Dropping job payload that is not JSON");
            return None;
        }
    };

    let Some(id) = value
        .get("id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
    else {
        error!("Dropping job payload without a valid id");
        return None;
    };

    let request = match decode_request(value) {
        Ok(request) => request,
        Err(e) => {
            warn!(job_id = %id, error = %e, "Rejecting malformed job");
            return Some(JobReply::new(id, e.into_result()));
        }
    };

    info!(job_id = %id, language = %request.language, files = request.files.len(), "Job received");

    let result = executor.run(&request).await;
    Some(JobReply::new(id, result))
}

fn decode_request(value: Value) -> Result<RunRequest, SandboxError> {
    let request: RunRequest =
        serde_json::from_value(value).map_err(|e| SandboxError::MalformedJob(e.to_string()))?;
    validate_request(&request)?;
    Ok(request)
}

/// Where claimed payloads come from.
#[async_trait]
pub trait JobSource: Send {
    /// Claim one payload, `None` when the poll interval elapsed idle.
    async fn claim(&mut self) -> RedisResult<Option<String>>;
}

/// BLMOVE from the shared queue into this worker's processing list
pub struct QueueSource {
    conn: ConnectionManager,
    queue: String,
    worker_id: String,
    poll_interval: Duration,
}

#[async_trait]
impl JobSource for QueueSource {
    async fn claim(&mut self) -> RedisResult<Option<String>> {
        job_queue::claim_job(&mut self.conn, &self.queue, &self.worker_id, self.poll_interval).await
    }
}

/// Claim loop shared by every source.
///
/// A claim in flight is never abandoned: once BLMOVE may have moved a payload
/// into the processing list, the payload is handed to `on_job` even if
/// shutdown fired meanwhile. Returns once shutdown is seen between claims.
pub async fn consume_jobs<S, F>(
    source: &mut S,
    slots: &Arc<Semaphore>,
    mut shutdown: Pin<&mut impl Future<Output = ()>>,
    mut on_job: F,
) -> Result<()>
where
    S: JobSource,
    F: FnMut(String, OwnedSemaphorePermit),
{
    let mut stopping = false;

    while !stopping {
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => permit?,
            _ = shutdown.as_mut() => break,
        };

        let claim = source.claim();
        tokio::pin!(claim);

        let claimed = tokio::select! {
            claimed = &mut claim => claimed,
            _ = shutdown.as_mut() => {
                stopping = true;
                debug!("Shutdown requested, waiting for the pending claim");
                claim.await
            }
        };

        match claimed {
            Ok(Some(payload)) => on_job(payload, permit),
            Ok(None) => {
                // Idle poll timeout
            }
            Err(e) => {
                error!(error = %e, "Redis error while claiming job");
                if !stopping {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    Ok(())
}

pub struct Dispatcher {
    executor: Arc<SandboxExecutor>,
    settings: WorkerSettings,
}

impl Dispatcher {
    pub fn new(executor: Arc<SandboxExecutor>, settings: WorkerSettings) -> Self {
        Self { executor, settings }
    }

    /// Consume jobs until `shutdown` resolves, then wait for in-flight jobs.
    ///
    /// `claim_conn` is dedicated to the blocking BLMOVE; replies and acks go
    /// through `reply_conn` so they are not stalled behind it.
    #[instrument(skip_all, fields(worker_id = %self.settings.worker_id, queue = %self.settings.queue.queue_name))]
    pub async fn run(
        &self,
        mut claim_conn: ConnectionManager,
        reply_conn: ConnectionManager,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let queue = self.settings.queue.queue_name.clone();
        let worker_id = self.settings.worker_id.clone();

        match job_queue::requeue_unacked(&mut claim_conn, &queue, &worker_id).await {
            Ok(0) => {}
            Ok(moved) => warn!(moved, "Requeued unacknowledged jobs from a previous run"),
            Err(e) => error!(error = %e, "Failed to requeue unacknowledged jobs"),
        }

        let concurrency = self.settings.concurrency;
        let slots = Arc::new(Semaphore::new(concurrency));
        tokio::pin!(shutdown);

        let mut source = QueueSource {
            conn: claim_conn,
            queue: queue.clone(),
            worker_id: worker_id.clone(),
            poll_interval: self.settings.poll_interval,
        };

        info!(concurrency, "Waiting for jobs");

        let ttl = self.settings.queue.result_ttl_secs;
        consume_jobs(&mut source, &slots, shutdown.as_mut(), |payload, permit| {
            let executor = self.executor.clone();
            let conn = reply_conn.clone();
            let queue = queue.clone();
            let worker_id = worker_id.clone();

            tokio::spawn(async move {
                process_job(&executor, conn, &queue, &worker_id, ttl, payload).await;
                drop(permit);
            });
        })
        .await?;

        warn!("Shutdown requested, draining in-flight jobs");
        let _all = slots.acquire_many(concurrency as u32).await?;
        info!("All in-flight jobs finished");
        Ok(())
    }
}

async fn process_job(
    executor: &SandboxExecutor,
    mut conn: ConnectionManager,
    queue: &str,
    worker_id: &str,
    ttl_secs: u64,
    payload: String,
) {
    let reply = handle_payload(executor, &payload).await;

    if let Some(reply) = reply {
        if !publish_with_retry(&mut conn, &reply, ttl_secs).await {
            // Leave it in the processing list; it is redelivered on restart
            error!(job_id = %reply.id, "Giving up on reply, job stays unacknowledged");
            return;
        }
        info!(
            job_id = %reply.id,
            exit_code = reply.result.exit_code,
            timed_out = reply.result.timed_out,
            "Job reported"
        );
    }

    if let Err(e) = job_queue::ack_job(&mut conn, queue, worker_id, &payload).await {
        warn!(error = %e, "Failed to acknowledge job");
    }
}

async fn publish_with_retry(conn: &mut ConnectionManager, reply: &JobReply, ttl_secs: u64) -> bool {
    for attempt in 1..=REPLY_ATTEMPTS {
        match job_queue::publish_reply(conn, reply, ttl_secs).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(job_id = %reply.id, attempt, error = %e, "Failed to publish reply");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
    }
    debug!(job_id = %reply.id, attempts = REPLY_ATTEMPTS, "Reply retries exhausted");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbox_common::types::{JobEnvelope, RunFile};
    use runbox_sandbox::{DirectBackend, LanguageProfiles};

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(
            Arc::new(DirectBackend::new()),
            Arc::new(LanguageProfiles::builtin()),
            Duration::from_secs(5),
        )
    }

    fn envelope(request: RunRequest) -> String {
        serde_json::to_string(&JobEnvelope {
            id: Uuid::new_v4(),
            request,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_job_is_executed() {
        let request = RunRequest::new("shell", vec![RunFile::new("msg.txt", "hello\n")]).with_run_cmd("cat msg.txt");
        let payload = envelope(request);

        let reply = handle_payload(&executor(), &payload).await.unwrap();
        assert_eq!(reply.result.exit_code, 0);
        assert_eq!(reply.output, "hello");
    }

    #[tokio::test]
    async fn test_reply_keeps_job_id() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": id,
            "language": "shell",
            "files": [{"name": "a.txt", "content": ""}],
            "run_cmd": "exit 7"
        })
        .to_string();

        let reply = handle_payload(&executor(), &payload).await.unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.result.exit_code, 7);
    }

    #[tokio::test]
    async fn test_missing_language_reported() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": id,
            "files": [{"name": "Main.py", "content": "print(1)"}]
        })
        .to_string();

        let reply = handle_payload(&executor(), &payload).await.unwrap();
        assert_eq!(reply.result.exit_code, 1);
        assert!(reply.output.contains("missing language"));
    }

    #[tokio::test]
    async fn test_empty_files_reported() {
        let payload = envelope(RunRequest::new("python", vec![]));
        let reply = handle_payload(&executor(), &payload).await.unwrap();
        assert_eq!(reply.result.exit_code, 1);
        assert!(reply.output.contains("Malformed job"));
    }

    #[tokio::test]
    async fn test_wrong_field_types_reported() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({ "id": id, "language": "python", "files": "Main.py" }).to_string();

        let reply = handle_payload(&executor(), &payload).await.unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.result.exit_code, 1);
    }

    /// Hands out queued payloads after a fixed delay, then idles.
    struct DelayedSource {
        delay: Duration,
        payloads: Vec<String>,
        claims: usize,
    }

    #[async_trait]
    impl JobSource for DelayedSource {
        async fn claim(&mut self) -> RedisResult<Option<String>> {
            self.claims += 1;
            tokio::time::sleep(self.delay).await;
            Ok(self.payloads.pop())
        }
    }

    #[tokio::test]
    async fn test_shutdown_keeps_claim_in_flight() {
        let mut source = DelayedSource {
            delay: Duration::from_millis(300),
            payloads: vec!["job-1".to_string()],
            claims: 0,
        };
        let slots = Arc::new(Semaphore::new(2));
        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        tokio::pin!(shutdown);

        let mut handled = Vec::new();
        consume_jobs(&mut source, &slots, shutdown.as_mut(), |payload, _permit| handled.push(payload))
            .await
            .unwrap();

        assert_eq!(handled, vec!["job-1".to_string()]);
        assert_eq!(source.claims, 1);
    }

    #[tokio::test]
    async fn test_idle_source_stops_on_shutdown() {
        let mut source = DelayedSource {
            delay: Duration::from_millis(20),
            payloads: Vec::new(),
            claims: 0,
        };
        let slots = Arc::new(Semaphore::new(1));
        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        tokio::pin!(shutdown);

        let mut handled = 0;
        tokio::time::timeout(
            Duration::from_secs(2),
            consume_jobs(&mut source, &slots, shutdown.as_mut(), |_, _| handled += 1),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(handled, 0);
        assert!(source.claims >= 2);
    }

    #[tokio::test]
    async fn test_unroutable_payloads_dropped() {
        assert!(handle_payload(&executor(), "not json").await.is_none());
        assert!(handle_payload(&executor(), r#"{"language": "python"}"#).await.is_none());
        assert!(handle_payload(&executor(), r#"{"id": "nope"}"#).await.is_none());
    }
}
