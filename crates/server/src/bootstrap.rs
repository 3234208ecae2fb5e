use std::sync::Arc;
use std::time::Duration;

use noteflow_agent::{
    CompletionClient, DispatchSettings, Dispatcher, EntityWriter, InMemoryEntityWriter, JobQueue,
    OpenAiClient, OpenAiClientConfig, ProviderError, Services,
};
use noteflow_core::catalog::CatalogError;
use noteflow_core::config::{AppConfig, ConfigError, LoadOptions};
use noteflow_db::{
    connect_with_config, migrations, DbPool, SqlJobRepository, SqlQuotaLedger, SqlUsageRepository,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: JobQueue,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider client could not be built: {0}")]
    Provider(#[source] ProviderError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let client: Arc<dyn CompletionClient> = Arc::new(
        OpenAiClient::new(OpenAiClientConfig {
            api_key: config.llm.api_key.clone(),
            timeout: Duration::from_secs(config.llm.timeout_secs.max(1)),
        })
        .map_err(BootstrapError::Provider)?,
    );
    bootstrap_with_client(config, client, Arc::new(InMemoryEntityWriter::default())).await
}

/// Wires storage, catalog and dispatcher around the given provider client.
/// The returned queue must be handed to a [`noteflow_agent::JobWorker`].
pub async fn bootstrap_with_client(
    config: AppConfig,
    client: Arc<dyn CompletionClient>,
    writer: Arc<dyn EntityWriter>,
) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let registry = config.catalog.build_registry(&config.llm)?;
    let templates = config.catalog.build_templates()?;
    info!(
        event_name = "system.bootstrap.catalog_loaded",
        providers = registry.providers().len(),
        models = registry.models().len(),
        templates = templates.templates().len(),
        "provider catalog loaded"
    );

    let services = Services {
        registry: Arc::new(RwLock::new(registry)),
        templates: Arc::new(RwLock::new(templates)),
        ledger: Arc::new(SqlQuotaLedger::new(db_pool.clone())),
        jobs: Arc::new(SqlJobRepository::new(db_pool.clone())),
        usage: Arc::new(SqlUsageRepository::new(db_pool.clone())),
        client,
        writer,
    };
    let (dispatcher, queue) = Dispatcher::new(services, DispatchSettings::from_config(&config));

    Ok(Application { config, db_pool, dispatcher: Arc::new(dispatcher), queue })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use noteflow_agent::InMemoryEntityWriter;
    use noteflow_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use noteflow_core::domain::quota::UserId;

    use super::{bootstrap, bootstrap_with_client};
    use crate::api::tests::StaticClient;

    #[tokio::test]
    async fn bootstrap_rejects_invalid_configuration() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                worker_count: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("dispatch.worker_count"), "{message}");
    }

    #[tokio::test]
    async fn bootstrap_migrates_schema_and_serves_quota_reads() {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;

        let app = bootstrap_with_client(
            config,
            Arc::new(StaticClient),
            Arc::new(InMemoryEntityWriter::default()),
        )
        .await
        .expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('quota_state', 'ai_operation_job', 'usage_record')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 3);

        let quota = app
            .dispatcher
            .get_quota_state(&UserId("user-boot".to_string()))
            .await
            .expect("quota");
        assert_eq!(quota.max_requests, 100);
        assert_eq!(quota.used_requests, 0);

        app.db_pool.close().await;
    }
}
