mod config;
mod dispatcher;
mod health;

use anyhow::Context;
use config::WorkerSettings;
use dispatcher::Dispatcher;
use runbox_common::logging::init_tracing;
use runbox_sandbox::SandboxExecutor;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("RunBox Worker booting...");

    let settings = WorkerSettings::from_env()?;

    let executor = SandboxExecutor::from_settings(&settings.sandbox).context("failed to initialize sandbox backend")?;
    info!(
        backend = executor.backend_name(),
        timeout_secs = executor.timeout().as_secs_f64(),
        languages = ?executor.profiles().languages().collect::<Vec<_>>(),
        "Sandbox ready"
    );

    let client = ::redis::Client::open(settings.queue.redis_url.as_str())?;
    // BLMOVE blocks its connection, so claims and replies use separate managers
    let claim_conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
    let reply_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!(
        redis_url = %settings.queue.redis_url,
        queue = %settings.queue.queue_name,
        worker_id = %settings.worker_id,
        "Connected to Redis"
    );

    let health_addr = settings.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr).await {
            error!(error = %e, "Health server stopped");
        }
    });

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal");
    };

    let dispatcher = Dispatcher::new(Arc::new(executor), settings);
    dispatcher.run(claim_conn, reply_conn, shutdown).await?;

    info!("Worker shutdown complete");
    Ok(())
}
