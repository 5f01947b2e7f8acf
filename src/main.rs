use std::sync::Arc;
use std::time::Duration;

use deferred_core::autoscale::{self, AutoscaleService, GuardrailMonitor, JobStoreGuardrails};
use deferred_core::config::{AutoscaleConfig, JobRunnerConfig};
use deferred_core::jobs::{self, HandlerRegistry, JobRunner, NoopHandler};
use deferred_core::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_target(false)
        .init();

    let runner_interval_secs: u64 = std::env::var("DEFERRED_CORE_RUNNER_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    let autoscale_interval_secs: u64 = std::env::var("DEFERRED_CORE_AUTOSCALE_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    let runner_config = JobRunnerConfig::from_env();
    let autoscale_config = AutoscaleConfig::from_env();

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::env::var("DEFERRED_CORE_DB_PATH")
        .unwrap_or_else(|_| "./data/deferred-core.db".to_string());
    let db: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?);

    // ── Job Runner ───────────────────────────────────────────────────────
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(NoopHandler::new("heartbeat"))).await;

    let runner = Arc::new(JobRunner::new(
        runner_config,
        Arc::clone(&db),
        Arc::clone(&handlers),
    ));
    let runner_handle = jobs::spawn_runner_ticker(
        Arc::clone(&runner),
        Duration::from_secs(runner_interval_secs.max(1)),
    );

    // ── Autoscale ────────────────────────────────────────────────────────
    let guardrails: Arc<dyn GuardrailMonitor> = Arc::new(JobStoreGuardrails::new(
        Arc::clone(&db),
        autoscale_config.clone(),
    ));
    let autoscaler = Arc::new(AutoscaleService::new(
        autoscale_config,
        Arc::clone(&db),
        guardrails,
    ));
    let autoscale_handle = autoscale::spawn_autoscale_ticker(
        Arc::clone(&autoscaler),
        Duration::from_secs(autoscale_interval_secs.max(1)),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_path = %db_path,
        handlers = handlers.count().await,
        runner_interval_secs,
        autoscale_interval_secs,
        "Deferred core started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    runner_handle.abort();
    autoscale_handle.abort();
    tracing::info!(
        capacity = autoscaler.current_capacity().await,
        "Deferred core stopped"
    );
    Ok(())
}
