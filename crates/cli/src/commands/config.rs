use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dbi_core::config::{AppConfig, LoadOptions, ProviderEndpoint, ProviderKind};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

/// One effective setting: dotted key, rendered value, and the env var that can override it.
struct Setting {
    key: String,
    value: String,
    env_key: Option<String>,
}

impl Setting {
    fn new(key: impl Into<String>, value: impl Into<String>, env_key: Option<&str>) -> Self {
        Self { key: key.into(), value: value.into(), env_key: env_key.map(str::to_string) }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source =
            field_source(&setting.key, setting.env_key.as_deref(), file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }
    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let mut settings = vec![
        Setting::new("database.url", &config.database.url, Some("DBI_DATABASE_URL")),
        Setting::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("DBI_DATABASE_MAX_CONNECTIONS"),
        ),
        Setting::new("llm.text_provider", config.llm.text_provider.as_str(), Some("DBI_LLM_TEXT_PROVIDER")),
        Setting::new("llm.vision_provider", config.llm.vision_provider.as_str(), Some("DBI_LLM_VISION_PROVIDER")),
        Setting::new(
            "llm.embedding_provider",
            config.llm.embedding_provider.as_str(),
            Some("DBI_LLM_EMBEDDING_PROVIDER"),
        ),
        Setting::new(
            "llm.embedding_dimensions",
            config.llm.embedding_dimensions.to_string(),
            Some("DBI_LLM_EMBEDDING_DIMENSIONS"),
        ),
    ];

    for kind in ProviderKind::ALL {
        settings.extend(endpoint_settings(kind, config.llm.endpoint(kind)));
    }

    settings.extend([
        Setting::new("soda.base_url", &config.soda.base_url, Some("DBI_SODA_BASE_URL")),
        Setting::new("soda.app_token", redact(config.soda.app_token.as_ref()), Some("DBI_SODA_APP_TOKEN")),
        Setting::new("soda.page_size", config.soda.page_size.to_string(), Some("DBI_SODA_PAGE_SIZE")),
        Setting::new("soda.row_cap", config.soda.row_cap.to_string(), None),
        Setting::new("soda.max_retries", config.soda.max_retries.to_string(), Some("DBI_SODA_MAX_RETRIES")),
        Setting::new("sandbox.program", &config.sandbox.program, Some("DBI_SANDBOX_PROGRAM")),
        Setting::new("sandbox.script", config.sandbox.script.display().to_string(), Some("DBI_SANDBOX_SCRIPT")),
        Setting::new(
            "sandbox.workspace_dir",
            config.sandbox.workspace_dir.display().to_string(),
            Some("DBI_SANDBOX_WORKSPACE_DIR"),
        ),
        Setting::new("server.bind_address", &config.server.bind_address, Some("DBI_SERVER_BIND_ADDRESS")),
        Setting::new("server.port", config.server.port.to_string(), Some("DBI_SERVER_PORT")),
        Setting::new("logging.level", &config.logging.level, Some("DBI_LOGGING_LEVEL")),
        Setting::new(
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            Some("DBI_LOGGING_FORMAT"),
        ),
    ]);
    settings
}

fn endpoint_settings(kind: ProviderKind, endpoint: &ProviderEndpoint) -> Vec<Setting> {
    let (section, prefix) = match kind {
        ProviderKind::Gemini => ("gemini", "DBI_LLM_GEMINI"),
        ProviderKind::OpenAi => ("openai", "DBI_LLM_OPENAI"),
        ProviderKind::WorkersAi => ("workers_ai", "DBI_LLM_WORKERS_AI"),
    };
    let setting = |field: &str, value: String| {
        let env_key = format!("{prefix}_{}", field.to_ascii_uppercase());
        Setting::new(format!("llm.{section}.{field}"), value, Some(env_key.as_str()))
    };
    vec![
        setting("api_key", redact(endpoint.api_key.as_ref())),
        setting("base_url", endpoint.base_url.clone()),
        setting("text_model", endpoint.text_model.clone()),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("dbi.toml"), PathBuf::from("config/dbi.toml")].into_iter().find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    file_doc: Option<&Value>,
    file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, key_path) {
            let file_path =
                file_path.map(|path| path.display().to_string()).unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps a recognisable prefix such as `sk-` and hides the rest.
fn redact(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}
