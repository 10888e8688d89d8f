use dbi_core::config::{AppConfig, LoadOptions};
use dbi_db::{connect_with_config, migrations};
use serde_json::json;

use crate::commands::{block_on, exit, CommandResult};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                exit::CONFIG,
            );
        }
    };

    let outcome = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), exit::DATABASE))?;
        migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), exit::MIGRATION))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match outcome {
        Ok(Ok(())) => CommandResult::success(
            "migrate",
            "applied pending migrations",
            Some(json!({ "database": config.database.url, "migrations": migrations::embedded_count() })),
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
        Err(message) => CommandResult::failure("migrate", "runtime_init", message, exit::RUNTIME),
    }
}

