mod coordinator;
mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use coordinator::{InMemoryRunStore, InlineDispatch, QueueDispatch, RunCoordinator, RunDispatch};
use redis::aio::ConnectionManager;
use runbox_common::config::{env_var, QueueSettings};
use runbox_common::logging::init_tracing;
use runbox_sandbox::{LanguageProfiles, SandboxExecutor, SandboxSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Extra time a producer waits beyond the sandbox timeout for queueing and
/// container setup.
const REPLY_SLACK: Duration = Duration::from_secs(30);

pub struct AppState {
    pub coordinator: RunCoordinator,
    pub profiles: Arc<LanguageProfiles>,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("RunBox API booting...");

    let queue = QueueSettings::from_env().context("invalid queue settings")?;
    let sandbox = SandboxSettings::from_env().context("invalid sandbox settings")?;
    let mode = env_var("RUNBOX_EXECUTION_MODE").unwrap_or_else(|| "queue".to_string());

    let profiles = Arc::new(LanguageProfiles::builtin().with_images(&sandbox.images));

    let dispatch: Arc<dyn RunDispatch> = match mode.to_lowercase().as_str() {
        "inline" => inline_dispatch(&sandbox)?,
        "queue" => match connect_queue(&queue).await {
            Ok((client, conn)) => {
                info!(redis_url = %queue.redis_url, queue = %queue.queue_name, "Connected to Redis");
                let reply_timeout = queue.reply_timeout.unwrap_or(sandbox.timeout + REPLY_SLACK);
                Arc::new(QueueDispatch::new(client, conn, queue.queue_name.clone(), reply_timeout))
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable, falling back to inline execution");
                inline_dispatch(&sandbox)?
            }
        },
        other => anyhow::bail!("RUNBOX_EXECUTION_MODE must be 'queue' or 'inline', got '{}'", other),
    };

    let coordinator = RunCoordinator::new(Arc::new(InMemoryRunStore::new()), dispatch);
    info!(mode = coordinator.dispatch_mode(), "Run coordinator ready");

    let state = Arc::new(AppState { coordinator, profiles });

    let addr = env_var("RUNBOX_API_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept runs");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("API shutdown complete");
    Ok(())
}

fn inline_dispatch(settings: &SandboxSettings) -> anyhow::Result<Arc<dyn RunDispatch>> {
    let executor = SandboxExecutor::from_settings(settings).context("failed to initialize sandbox backend")?;
    info!(backend = executor.backend_name(), "Executing runs inline");
    Ok(Arc::new(InlineDispatch::new(Arc::new(executor))))
}

async fn connect_queue(settings: &QueueSettings) -> anyhow::Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(settings.redis_url.as_str())?;
    let conn = ConnectionManager::new(client.clone()).await?;
    Ok((client, conn))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal");
}
