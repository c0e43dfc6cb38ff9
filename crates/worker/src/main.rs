use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use courier_infra::{OutboxProcessor, OutboxWorker, PostgresOutboxStore, ProcessorConfig};
use courier_worker::{AUDIT_EVENT_TYPES_VAR, audit_event_types, build_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = ProcessorConfig::from_env().context("invalid outbox configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let audit_types = audit_event_types(std::env::var(AUDIT_EVENT_TYPES_VAR).ok().as_deref());
    let registry = build_registry(&audit_types).context("handler registration failed")?;

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresOutboxStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to apply outbox schema")?;

    info!(
        worker_id = %config.worker_id,
        enabled = config.enabled,
        handlers = ?registry.event_types(),
        "starting outbox worker"
    );

    let handle = OutboxWorker::spawn(OutboxProcessor::new(store, registry, config));

    shutdown_signal().await?;

    let stats = handle.shutdown().await;
    info!(
        ticks = stats.ticks,
        succeeded = stats.succeeded,
        retried = stats.retried,
        quarantined = stats.quarantined,
        "outbox worker shut down"
    );
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received CTRL+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl+C")?;
        info!("Received CTRL+C signal");
    }

    Ok(())
}
