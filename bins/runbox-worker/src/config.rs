// Worker configuration, read once at boot

use anyhow::{Context, Result};
use runbox_common::config::{env_parse, env_var, QueueSettings};
use runbox_sandbox::SandboxSettings;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueSettings,
    pub sandbox: SandboxSettings,
    /// Jobs executed at once by this process
    pub concurrency: usize,
    /// Names this worker's processing list; must be stable across restarts
    /// for unacknowledged jobs to be redelivered.
    pub worker_id: String,
    pub health_addr: String,
    /// BLMOVE timeout, bounds how quickly shutdown is noticed while idle
    pub poll_interval: Duration,
}

const FALLBACK_WORKER_ID: &str = "runbox-worker";

/// Host name, which survives a restart in place (container hostnames are
/// the container id). Falls back to a fixed id so redelivery still works.
fn default_worker_id() -> String {
    env_var("HOSTNAME")
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .and_then(|name| worker_id_from(&name))
        .unwrap_or_else(|| FALLBACK_WORKER_ID.to_string())
}

fn worker_id_from(raw: &str) -> Option<String> {
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        let concurrency: usize = env_parse("RUNBOX_WORKER_CONCURRENCY", 2)?;

        Ok(Self {
            queue: QueueSettings::from_env().context("invalid queue settings")?,
            sandbox: SandboxSettings::from_env().context("invalid sandbox settings")?,
            concurrency: concurrency.max(1),
            worker_id: env_var("RUNBOX_WORKER_ID").unwrap_or_else(default_worker_id),
            health_addr: env_var("RUNBOX_WORKER_HEALTH_ADDR").unwrap_or_else(|| "0.0.0.0:8081".to_string()),
            poll_interval: Duration::from_secs(5),
        })
    }
}
