use std::sync::Arc;

use dbi_agent::llm::ProviderRegistry;
use dbi_agent::workers::{standard_directory, FetchSettings, ProcessSandbox, SodaClient};
use dbi_agent::{AdapterError, AgentDeps, DatasetError, EventHub, LlmIntentClassifier, Orchestrator, RequestJournal};
use dbi_core::config::{AppConfig, ConfigError, LoadOptions};
use dbi_db::{
    connect_with_config, migrations, ActorStateRepository, DbPool, RequestRepository, SqlActorStateRepository,
    SqlRequestRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider setup failed: {0}")]
    Providers(#[from] AdapterError),
    #[error("dataset client setup failed: {0}")]
    Datasets(#[from] DatasetError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let requests: Arc<dyn RequestRepository> = Arc::new(SqlRequestRepository::new(db_pool.clone()));
    let state: Arc<dyn ActorStateRepository> = Arc::new(SqlActorStateRepository::new(db_pool.clone()));
    let journal = RequestJournal::new(requests, EventHub::default());

    let providers = ProviderRegistry::from_config(&config.llm)?;
    info!(
        event_name = "system.bootstrap.providers_ready",
        text_provider = config.llm.text_provider.as_str(),
        vision_provider = config.llm.vision_provider.as_str(),
        embedding_provider = config.llm.embedding_provider.as_str(),
        "provider bindings resolved"
    );
    let deps = AgentDeps { providers: Arc::new(providers), state, journal: journal.clone() };

    let source = Arc::new(SodaClient::from_config(&config.soda)?);
    let sandbox = Arc::new(ProcessSandbox::from_config(&config.sandbox));
    let directory = standard_directory(&deps, source, sandbox, FetchSettings::from(&config.soda));
    let classifier = Arc::new(LlmIntentClassifier::new(deps));
    let orchestrator = Orchestrator::new(journal, directory, classifier);

    Ok(Application { config, db_pool, orchestrator })
}

#[cfg(test)]
mod tests {
    use dbi_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_urls() {
        let result = bootstrap(overrides("postgres://localhost/dbi")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_orchestrator() {
        let app = bootstrap(overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed without provider credentials");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('request', 'request_meta', 'request_log', 'request_result', 'actor_state')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables after bootstrap");
        assert_eq!(table_count, 5);
        assert_eq!(app.orchestrator.journal().hub().observer_count(), 0);

        app.db_pool.close().await;
    }
}
