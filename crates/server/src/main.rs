mod api;
mod bootstrap;
mod health;
mod maintenance;

use std::time::Duration;

use anyhow::Result;
use noteflow_agent::JobWorker;
use noteflow_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;

use crate::maintenance::Maintenance;

fn init_logging(config: &AppConfig) {
    use noteflow_core::config::LogFormat::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let worker = JobWorker::new(&app.dispatcher).start(app.queue);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services = app.dispatcher.services();
    let maintenance = Maintenance::new(
        services.ledger.clone(),
        services.usage.clone(),
        app.config.quota.usage_retention_days,
    )
    .spawn(Duration::from_secs(app.config.server.maintenance_interval_secs), shutdown_rx.clone());

    let router = api::router(app.dispatcher.clone()).merge(health::router(app.db_pool.clone()));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        "noteflow-server listening"
    );

    let mut server_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "noteflow-server stopping");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs.max(1));
    if tokio::time::timeout(grace, worker.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.worker.shutdown_timeout",
            "workers did not drain in time; running jobs will be recovered on next start"
        );
    }
    let _ = maintenance.await;
    server.await??;
    app.db_pool.close().await;

    tracing::info!(event_name = "system.server.stopped", "noteflow-server stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
