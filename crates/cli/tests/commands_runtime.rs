use std::env;
use std::sync::{Mutex, OnceLock};

use dbi_cli::commands::{config, doctor, migrate};
use serde_json::Value;

const MEMORY_DB: (&str, &str) = ("DBI_DATABASE_URL", "sqlite::memory:");

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[MEMORY_DB], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["details"]["migrations"], 1);
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("DBI_DATABASE_URL", "postgres://localhost/dbi")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_flags_bound_providers_without_credentials() {
    with_env(&[MEMORY_DB], || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(report["overall_status"], "fail");

        let provider = check(&report, "provider_credentials");
        assert_eq!(provider["status"], "fail");
        assert!(provider["details"].as_str().unwrap_or_default().contains("gemini"));
        assert_eq!(check(&report, "database_schema")["status"], "pass");
    });
}

#[test]
fn doctor_passes_credentials_once_the_key_is_set() {
    with_env(&[MEMORY_DB, ("DBI_LLM_GEMINI_API_KEY", "test-key-123")], || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(check(&report, "provider_credentials")["status"], "pass");
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("DBI_SODA_PAGE_SIZE", "0")], || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(check(&report, "config_validation")["status"], "fail");
        assert_eq!(check(&report, "database_schema")["status"], "skipped");
        assert_eq!(check(&report, "sandbox_script")["status"], "skipped");
    });
}

#[test]
fn config_redacts_secrets_and_attributes_env_sources() {
    with_env(&[MEMORY_DB, ("DBI_LLM_OPENAI_API_KEY", "sk-live-abcdef")], || {
        let output = config::run();
        assert!(output.contains("- llm.openai.api_key = sk-*** (source: env (DBI_LLM_OPENAI_API_KEY))"));
        assert!(output.contains("- database.url = sqlite::memory: (source: env (DBI_DATABASE_URL))"));
        assert!(output.contains("- llm.gemini.api_key = <unset> (source: default)"));
        assert!(!output.contains("abcdef"));
    });
}

fn check<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .unwrap_or_else(|| panic!("missing check `{name}`"))
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "DBI_DATABASE_URL",
        "DBI_DATABASE_MAX_CONNECTIONS",
        "DBI_DATABASE_TIMEOUT_SECS",
        "DBI_LLM_TEXT_PROVIDER",
        "DBI_LLM_VISION_PROVIDER",
        "DBI_LLM_EMBEDDING_PROVIDER",
        "DBI_LLM_GEMINI_API_KEY",
        "DBI_LLM_OPENAI_API_KEY",
        "DBI_LLM_WORKERS_AI_API_KEY",
        "DBI_SODA_PAGE_SIZE",
        "DBI_SODA_APP_TOKEN",
        "DBI_SANDBOX_SCRIPT",
        "DBI_LOGGING_LEVEL",
        "DBI_LOGGING_FORMAT",
        "DBI_LOG_LEVEL",
        "DBI_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
