use crate::types::{JobEnvelope, JobReply};
use redis::aio::ConnectionLike;
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use uuid::Uuid;

/// Redis queue semantics shared by the API and the worker so key layout
/// never drifts between producer and consumer.
///
/// - `runbox:queue:{queue}` FIFO list of pending jobs (RPUSH / BLMOVE from the left)
/// - `runbox:processing:{queue}:{worker}` jobs claimed by one worker, removed after reply
/// - `runbox:reply:{id}` one-shot reply list the producer blocks on
/// - `runbox:result:{id}` reply copy kept for late polling

pub const QUEUE_PREFIX: &str = "runbox:queue";
pub const PROCESSING_PREFIX: &str = "runbox:processing";
pub const REPLY_PREFIX: &str = "runbox:reply";
pub const RESULT_PREFIX: &str = "runbox:result";

pub fn queue_key(queue_name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue_name)
}

pub fn processing_key(queue_name: &str, worker_id: &str) -> String {
    format!("{}:{}:{}", PROCESSING_PREFIX, queue_name, worker_id)
}

pub fn reply_key(job_id: &Uuid) -> String {
    format!("{}:{}", REPLY_PREFIX, job_id)
}

pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn deserialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Blocking timeouts of zero mean "forever" to Redis; keep them strictly positive.
fn blocking_timeout(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.01)
}

/// Push a job onto the queue. RPUSH keeps FIFO order with BLMOVE from the left.
pub async fn push_job<C>(conn: &mut C, queue_name: &str, job: &JobEnvelope) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(queue_key(queue_name), payload).await
}

/// Atomically move the next job into this worker's processing list and return
/// its raw payload. Decoding is left to the caller so malformed payloads can be
/// reported instead of lost.
pub async fn claim_job<C>(
    conn: &mut C,
    queue_name: &str,
    worker_id: &str,
    timeout: Duration,
) -> RedisResult<Option<String>>
where
    C: ConnectionLike + Send,
{
    redis::cmd("BLMOVE")
        .arg(queue_key(queue_name))
        .arg(processing_key(queue_name, worker_id))
        .arg("LEFT")
        .arg("RIGHT")
        .arg(blocking_timeout(timeout))
        .query_async(conn)
        .await
}

/// Acknowledge a claimed job by dropping it from the processing list.
pub async fn ack_job<C>(conn: &mut C, queue_name: &str, worker_id: &str, payload: &str) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    let _: i64 = conn.lrem(processing_key(queue_name, worker_id), 1, payload).await?;
    Ok(())
}

/// Move everything left in this worker's processing list back to the head of
/// the queue. Called on boot so jobs interrupted by a crash are redelivered.
pub async fn requeue_unacked<C>(conn: &mut C, queue_name: &str, worker_id: &str) -> RedisResult<usize>
where
    C: ConnectionLike + Send,
{
    let mut moved = 0;
    loop {
        let payload: Option<String> = redis::cmd("LMOVE")
            .arg(processing_key(queue_name, worker_id))
            .arg(queue_key(queue_name))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(conn)
            .await?;
        match payload {
            Some(_) => moved += 1,
            None => return Ok(moved),
        }
    }
}

/// Publish a reply to the producer's reply list and keep a copy under the
/// result key. Both expire after `ttl_secs`.
pub async fn publish_reply<C>(conn: &mut C, reply: &JobReply, ttl_secs: u64) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    let payload = serde_json::to_string(reply).map_err(serialization_error)?;
    let key = reply_key(&reply.id);

    redis::pipe()
        .atomic()
        .rpush(&key, &payload)
        .ignore()
        .cmd("EXPIRE")
        .arg(&key)
        .arg(ttl_secs)
        .ignore()
        .cmd("SET")
        .arg(result_key(&reply.id))
        .arg(&payload)
        .arg("EX")
        .arg(ttl_secs)
        .ignore()
        .query_async(conn)
        .await
}

/// Block until the worker replies for `job_id`, or `timeout` elapses.
///
/// BLPOP stalls the whole connection, so callers should pass a dedicated
/// connection rather than a shared manager.
pub async fn await_reply<C>(conn: &mut C, job_id: &Uuid, timeout: Duration) -> RedisResult<Option<JobReply>>
where
    C: ConnectionLike + Send,
{
    let popped: Option<(String, String)> = conn.blpop(reply_key(job_id), blocking_timeout(timeout)).await?;

    match popped {
        Some((_key, payload)) => {
            let reply: JobReply = serde_json::from_str(&payload).map_err(deserialization_error)?;
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Retrieve a stored reply without consuming it.
pub async fn get_result<C>(conn: &mut C, job_id: &Uuid) -> RedisResult<Option<JobReply>>
where
    C: ConnectionLike + Send,
{
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let reply: JobReply = serde_json::from_str(&data).map_err(deserialization_error)?;
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Enqueue a job and wait for its reply on a fresh connection from `client`.
pub async fn submit_and_wait<C>(
    client: &redis::Client,
    conn: &mut C,
    queue_name: &str,
    job: &JobEnvelope,
    timeout: Duration,
) -> RedisResult<Option<JobReply>>
where
    C: ConnectionLike + Send,
{
    // Open the waiting connection first so a fast worker cannot reply before we listen.
    let mut waiter = client.get_multiplexed_async_connection().await?;
    push_job(conn, queue_name, job).await?;
    await_reply(&mut waiter, &job.id, timeout).await
}
