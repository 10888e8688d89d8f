use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub soda: SodaConfig,
    pub sandbox: SandboxConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub text_provider: ProviderKind,
    pub vision_provider: ProviderKind,
    pub embedding_provider: ProviderKind,
    pub embedding_dimensions: usize,
    pub timeout_secs: u64,
    pub gemini: ProviderEndpoint,
    pub openai: ProviderEndpoint,
    pub workers_ai: ProviderEndpoint,
}

/// Credentials and default models for one provider family.
#[derive(Clone, Debug)]
pub struct ProviderEndpoint {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub account_id: Option<String>,
    pub text_model: String,
    pub vision_model: String,
    pub embedding_model: String,
}

#[derive(Clone, Debug)]
pub struct SodaConfig {
    pub base_url: String,
    pub app_token: Option<SecretString>,
    pub page_size: u32,
    pub row_cap: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub program: String,
    pub script: PathBuf,
    pub workspace_dir: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "worker-ai", alias = "workers_ai", alias = "workers-ai")]
    WorkersAi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Gemini, Self::OpenAi, Self::WorkersAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::WorkersAi => "worker-ai",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub text_provider: Option<ProviderKind>,
    pub soda_base_url: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://dbi.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                text_provider: ProviderKind::Gemini,
                vision_provider: ProviderKind::Gemini,
                embedding_provider: ProviderKind::Gemini,
                embedding_dimensions: 768,
                timeout_secs: 60,
                gemini: ProviderEndpoint {
                    api_key: None,
                    base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                    account_id: None,
                    text_model: "gemini-2.5-flash".to_string(),
                    vision_model: "gemini-2.5-flash".to_string(),
                    embedding_model: "text-embedding-004".to_string(),
                },
                openai: ProviderEndpoint {
                    api_key: None,
                    base_url: "https://api.openai.com/v1".to_string(),
                    account_id: None,
                    text_model: "gpt-4o-mini".to_string(),
                    vision_model: "gpt-4o-mini".to_string(),
                    embedding_model: "text-embedding-3-small".to_string(),
                },
                workers_ai: ProviderEndpoint {
                    api_key: None,
                    base_url: "https://api.cloudflare.com/client/v4".to_string(),
                    account_id: None,
                    text_model: "@cf/meta/llama-3.3-70b-instruct-fp8-fast".to_string(),
                    vision_model: "@cf/meta/llama-3.2-11b-vision-instruct".to_string(),
                    embedding_model: "@cf/baai/bge-base-en-v1.5".to_string(),
                },
            },
            soda: SodaConfig {
                base_url: "https://data.sfgov.org/resource".to_string(),
                app_token: None,
                page_size: 1000,
                row_cap: 20_000,
                max_retries: 1,
                retry_base_delay_ms: 500,
                timeout_secs: 60,
            },
            sandbox: SandboxConfig {
                program: "python3".to_string(),
                script: PathBuf::from("scripts/run_bulk_analysis.py"),
                workspace_dir: PathBuf::from("workspace"),
                timeout_secs: 600,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "worker-ai" | "workers_ai" | "workers-ai" => Ok(Self::WorkersAi),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected gemini|openai|worker-ai)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmConfig {
    pub fn endpoint(&self, kind: ProviderKind) -> &ProviderEndpoint {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::WorkersAi => &self.workers_ai,
        }
    }

    fn endpoint_mut(&mut self, kind: ProviderKind) -> &mut ProviderEndpoint {
        match kind {
            ProviderKind::Gemini => &mut self.gemini,
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::WorkersAi => &mut self.workers_ai,
        }
    }
}

impl ProviderEndpoint {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dbi.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.text_provider {
                self.llm.text_provider = provider;
            }
            if let Some(provider) = llm.vision_provider {
                self.llm.vision_provider = provider;
            }
            if let Some(provider) = llm.embedding_provider {
                self.llm.embedding_provider = provider;
            }
            if let Some(embedding_dimensions) = llm.embedding_dimensions {
                self.llm.embedding_dimensions = embedding_dimensions;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            let endpoints = [
                (ProviderKind::Gemini, llm.gemini),
                (ProviderKind::OpenAi, llm.openai),
                (ProviderKind::WorkersAi, llm.workers_ai),
            ];
            for (kind, endpoint) in endpoints {
                if let Some(endpoint) = endpoint {
                    endpoint.apply(self.llm.endpoint_mut(kind));
                }
            }
        }

        if let Some(soda) = patch.soda {
            if let Some(base_url) = soda.base_url {
                self.soda.base_url = base_url;
            }
            if let Some(app_token) = soda.app_token {
                self.soda.app_token = Some(secret_value(app_token));
            }
            if let Some(page_size) = soda.page_size {
                self.soda.page_size = page_size;
            }
            if let Some(row_cap) = soda.row_cap {
                self.soda.row_cap = row_cap;
            }
            if let Some(max_retries) = soda.max_retries {
                self.soda.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = soda.retry_base_delay_ms {
                self.soda.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(timeout_secs) = soda.timeout_secs {
                self.soda.timeout_secs = timeout_secs;
            }
        }

        if let Some(sandbox) = patch.sandbox {
            if let Some(program) = sandbox.program {
                self.sandbox.program = program;
            }
            if let Some(script) = sandbox.script {
                self.sandbox.script = script;
            }
            if let Some(workspace_dir) = sandbox.workspace_dir {
                self.sandbox.workspace_dir = workspace_dir;
            }
            if let Some(timeout_secs) = sandbox.timeout_secs {
                self.sandbox.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DBI_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DBI_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("DBI_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DBI_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DBI_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DBI_LLM_TEXT_PROVIDER") {
            self.llm.text_provider = value.parse()?;
        }
        if let Some(value) = read_env("DBI_LLM_VISION_PROVIDER") {
            self.llm.vision_provider = value.parse()?;
        }
        if let Some(value) = read_env("DBI_LLM_EMBEDDING_PROVIDER") {
            self.llm.embedding_provider = value.parse()?;
        }
        if let Some(value) = read_env("DBI_LLM_EMBEDDING_DIMENSIONS") {
            self.llm.embedding_dimensions = parse_u32("DBI_LLM_EMBEDDING_DIMENSIONS", &value)? as usize;
        }
        if let Some(value) = read_env("DBI_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DBI_LLM_TIMEOUT_SECS", &value)?;
        }
        for kind in ProviderKind::ALL {
            let prefix = match kind {
                ProviderKind::Gemini => "DBI_LLM_GEMINI",
                ProviderKind::OpenAi => "DBI_LLM_OPENAI",
                ProviderKind::WorkersAi => "DBI_LLM_WORKERS_AI",
            };
            let endpoint = self.llm.endpoint_mut(kind);
            if let Some(value) = read_env(&format!("{prefix}_API_KEY")) {
                endpoint.api_key = Some(secret_value(value));
            }
            if let Some(value) = read_env(&format!("{prefix}_BASE_URL")) {
                endpoint.base_url = value;
            }
            if let Some(value) = read_env(&format!("{prefix}_ACCOUNT_ID")) {
                endpoint.account_id = Some(value);
            }
            if let Some(value) = read_env(&format!("{prefix}_TEXT_MODEL")) {
                endpoint.text_model = value;
            }
        }

        if let Some(value) = read_env("DBI_SODA_BASE_URL") {
            self.soda.base_url = value;
        }
        if let Some(value) = read_env("DBI_SODA_APP_TOKEN") {
            self.soda.app_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("DBI_SODA_PAGE_SIZE") {
            self.soda.page_size = parse_u32("DBI_SODA_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("DBI_SODA_MAX_RETRIES") {
            self.soda.max_retries = parse_u32("DBI_SODA_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DBI_SANDBOX_PROGRAM") {
            self.sandbox.program = value;
        }
        if let Some(value) = read_env("DBI_SANDBOX_SCRIPT") {
            self.sandbox.script = PathBuf::from(value);
        }
        if let Some(value) = read_env("DBI_SANDBOX_WORKSPACE_DIR") {
            self.sandbox.workspace_dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("DBI_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DBI_SERVER_PORT") {
            self.server.port = parse_u16("DBI_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DBI_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DBI_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("DBI_LOGGING_LEVEL").or_else(|| read_env("DBI_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("DBI_LOGGING_FORMAT").or_else(|| read_env("DBI_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(text_provider) = overrides.text_provider {
            self.llm.text_provider = text_provider;
        }
        if let Some(soda_base_url) = overrides.soda_base_url {
            self.soda.base_url = soda_base_url;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_soda(&self.soda)?;
        validate_sandbox(&self.sandbox)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dbi.toml"), PathBuf::from("config/dbi.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(ConfigError::Validation(format!("{key} must start with http:// or https://")));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=600".to_string()));
    }

    if llm.embedding_dimensions == 0 {
        return Err(ConfigError::Validation(
            "llm.embedding_dimensions must be greater than zero".to_string(),
        ));
    }

    for kind in ProviderKind::ALL {
        let endpoint = llm.endpoint(kind);
        validate_http_url(&format!("llm.{}.base_url", section_name(kind)), &endpoint.base_url)?;
        if endpoint.text_model.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "llm.{}.text_model must not be empty",
                section_name(kind)
            )));
        }
    }

    let workers_bound = [llm.text_provider, llm.vision_provider, llm.embedding_provider]
        .contains(&ProviderKind::WorkersAi);
    if workers_bound
        && llm.workers_ai.has_credentials()
        && llm.workers_ai.account_id.as_deref().map_or(true, |id| id.trim().is_empty())
    {
        return Err(ConfigError::Validation(
            "llm.workers_ai.account_id is required when worker-ai is bound and an api_key is set"
                .to_string(),
        ));
    }

    Ok(())
}

fn section_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gemini => "gemini",
        ProviderKind::OpenAi => "openai",
        ProviderKind::WorkersAi => "workers_ai",
    }
}

fn validate_soda(soda: &SodaConfig) -> Result<(), ConfigError> {
    validate_http_url("soda.base_url", &soda.base_url)?;

    if soda.page_size == 0 || soda.page_size > 50_000 {
        return Err(ConfigError::Validation("soda.page_size must be in range 1..=50000".to_string()));
    }

    if soda.row_cap == 0 {
        return Err(ConfigError::Validation("soda.row_cap must be greater than zero".to_string()));
    }

    if soda.max_retries > 5 {
        return Err(ConfigError::Validation("soda.max_retries must be at most 5".to_string()));
    }

    if soda.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "soda.timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_sandbox(sandbox: &SandboxConfig) -> Result<(), ConfigError> {
    if sandbox.program.trim().is_empty() {
        return Err(ConfigError::Validation("sandbox.program must not be empty".to_string()));
    }

    if sandbox.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "sandbox.timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    soda: Option<SodaPatch>,
    sandbox: Option<SandboxPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    text_provider: Option<ProviderKind>,
    vision_provider: Option<ProviderKind>,
    embedding_provider: Option<ProviderKind>,
    embedding_dimensions: Option<usize>,
    timeout_secs: Option<u64>,
    gemini: Option<EndpointPatch>,
    openai: Option<EndpointPatch>,
    workers_ai: Option<EndpointPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    account_id: Option<String>,
    text_model: Option<String>,
    vision_model: Option<String>,
    embedding_model: Option<String>,
}

impl EndpointPatch {
    fn apply(self, endpoint: &mut ProviderEndpoint) {
        if let Some(api_key) = self.api_key {
            endpoint.api_key = Some(secret_value(api_key));
        }
        if let Some(base_url) = self.base_url {
            endpoint.base_url = base_url;
        }
        if let Some(account_id) = self.account_id {
            endpoint.account_id = Some(account_id);
        }
        if let Some(text_model) = self.text_model {
            endpoint.text_model = text_model;
        }
        if let Some(vision_model) = self.vision_model {
            endpoint.vision_model = vision_model;
        }
        if let Some(embedding_model) = self.embedding_model {
            endpoint.embedding_model = embedding_model;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SodaPatch {
    base_url: Option<String>,
    app_token: Option<String>,
    page_size: Option<u32>,
    row_cap: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SandboxPatch {
    program: Option<String>,
    script: Option<PathBuf>,
    workspace_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, ProviderKind};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_load_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.soda.row_cap == 20_000, "default row cap should be 20000")?;
        ensure(config.soda.max_retries == 1, "page fetches retry once by default")?;
        ensure(config.llm.text_provider == ProviderKind::Gemini, "gemini is the default text backend")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_GEMINI_KEY", "gemini-from-env");
        env::set_var("TEST_SODA_TOKEN", "soda-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dbi.toml");
            fs::write(
                &path,
                r#"
[llm.gemini]
api_key = "${TEST_GEMINI_KEY}"

[soda]
app_token = "${TEST_SODA_TOKEN}"
page_size = 250
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.gemini.api_key.as_ref().map(|key| key.expose_secret())
                    == Some("gemini-from-env"),
                "gemini key should be interpolated from the environment",
            )?;
            ensure(
                config.soda.app_token.as_ref().map(|token| token.expose_secret())
                    == Some("soda-from-env"),
                "soda token should be interpolated from the environment",
            )?;
            ensure(config.soda.page_size == 250, "page size should come from the file")?;
            Ok(())
        })();

        clear_vars(&["TEST_GEMINI_KEY", "TEST_SODA_TOKEN"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DBI_LOG_LEVEL", "warn");
        env::set_var("DBI_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["DBI_LOG_LEVEL", "DBI_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DBI_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DBI_LLM_TEXT_PROVIDER", "worker-ai");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dbi.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[llm]
text_provider = "openai"
embedding_dimensions = 1536

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.llm.text_provider == ProviderKind::WorkersAi,
                "env text provider should win over file",
            )?;
            ensure(config.llm.embedding_dimensions == 1536, "file value should win over default")?;
            Ok(())
        })();

        clear_vars(&["DBI_DATABASE_URL", "DBI_LLM_TEXT_PROVIDER"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DBI_SODA_PAGE_SIZE", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("soda.page_size")
            );
            ensure(has_message, "validation failure should mention soda.page_size")
        })();

        clear_vars(&["DBI_SODA_PAGE_SIZE"]);
        result
    }

    #[test]
    fn unknown_provider_tag_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DBI_LLM_TEXT_PROVIDER", "anthropic");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("unknown provider should fail".to_string()),
            Err(error) => ensure(
                error.to_string().contains("gemini|openai|worker-ai"),
                "error should list supported providers",
            ),
        };
        clear_vars(&["DBI_LLM_TEXT_PROVIDER"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DBI_LLM_OPENAI_API_KEY", "sk-secret-value");
        env::set_var("DBI_SODA_APP_TOKEN", "soda-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("soda-secret-value"),
                "debug output should not contain soda token",
            )?;
            ensure(config.llm.openai.has_credentials(), "openai key should be present")?;
            Ok(())
        })();

        clear_vars(&["DBI_LLM_OPENAI_API_KEY", "DBI_SODA_APP_TOKEN"]);
        result
    }
}
