//! Provider adapters: one implementation per backend family behind [`ProviderAdapter`].
//!
//! Adapters are stateless apart from their HTTP client and configuration, so a
//! single [`ProviderRegistry`] is shared by every actor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dbi_core::config::LlmConfig;

use crate::errors::AdapterError;

pub mod gemini;
pub mod openai;
pub mod structured;
pub mod workers_ai;

pub use dbi_core::config::ProviderKind;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use workers_ai::WorkersAiAdapter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TextOptions {
    pub system_instruction: Option<String>,
    pub history: Vec<Turn>,
    pub effort: Effort,
    pub sanitize: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StructuredOptions {
    pub reasoning_effort: Option<Effort>,
    pub structuring_instruction: Option<String>,
}

/// Image handed to a vision backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageInput {
    /// Base64-encoded bytes.
    Inline { mime_type: String, data: String },
    Remote { url: String },
}

impl ImageInput {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Inline { .. } => "inline",
            Self::Remote { .. } => "remote",
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        options: &TextOptions,
    ) -> Result<String, AdapterError>;

    async fn generate_structured(
        &self,
        model: &str,
        prompt: &str,
        schema: &Value,
        options: &StructuredOptions,
    ) -> Result<Value, AdapterError>;

    async fn generate_vision(
        &self,
        model: &str,
        image: &ImageInput,
        prompt: &str,
    ) -> Result<String, AdapterError>;

    async fn generate_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>, AdapterError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelDefaults {
    pub text: String,
    pub vision: String,
    pub embedding: String,
}

/// Provider bindings for the three generation modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bindings {
    pub text: ProviderKind,
    pub vision: ProviderKind,
    pub embedding: ProviderKind,
}

/// Lookup table from provider tag to adapter.
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    models: HashMap<ProviderKind, ModelDefaults>,
    bindings: Bindings,
    embedding_dimensions: usize,
}

impl ProviderRegistry {
    pub fn new(bindings: Bindings, embedding_dimensions: usize) -> Self {
        Self { adapters: HashMap::new(), models: HashMap::new(), bindings, embedding_dimensions }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, models: ModelDefaults) {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        self.models.insert(kind, models);
    }

    /// Registers an HTTP adapter for every provider that has credentials.
    pub fn from_config(config: &LlmConfig) -> Result<Self, AdapterError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut registry = Self::new(
            Bindings {
                text: config.text_provider,
                vision: config.vision_provider,
                embedding: config.embedding_provider,
            },
            config.embedding_dimensions,
        );

        for kind in ProviderKind::ALL {
            let endpoint = config.endpoint(kind);
            if !endpoint.has_credentials() {
                tracing::debug!(
                    event_name = "llm.registry.provider_skipped",
                    provider = kind.as_str(),
                    "provider has no credentials"
                );
                continue;
            }
            let adapter: Arc<dyn ProviderAdapter> = match kind {
                ProviderKind::Gemini => Arc::new(GeminiAdapter::from_endpoint(endpoint, timeout)?),
                ProviderKind::OpenAi => Arc::new(OpenAiAdapter::from_endpoint(endpoint, timeout)?),
                ProviderKind::WorkersAi => {
                    Arc::new(WorkersAiAdapter::from_endpoint(endpoint, timeout)?)
                }
            };
            registry.register(
                adapter,
                ModelDefaults {
                    text: endpoint.text_model.clone(),
                    vision: endpoint.vision_model.clone(),
                    embedding: endpoint.embedding_model.clone(),
                },
            );
        }

        Ok(registry)
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings
    }

    pub fn embedding_dimensions(&self) -> usize {
        self.embedding_dimensions
    }

    pub fn is_registered(&self, kind: ProviderKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn adapter(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
        self.adapters.get(&kind).cloned().ok_or(AdapterError::Unavailable(kind))
    }

    pub fn models(&self, kind: ProviderKind) -> Result<&ModelDefaults, AdapterError> {
        self.models.get(&kind).ok_or(AdapterError::Unavailable(kind))
    }
}

/// Strips `<think>` blocks and a surrounding code fence from model output.
pub fn sanitize(raw: &str) -> String {
    let mut text = raw.to_string();
    while let Some(start) = text.find("<think>") {
        match text[start..].find("</think>") {
            Some(offset) => text.replace_range(start..start + offset + "</think>".len(), ""),
            None => text.truncate(start),
        }
    }

    let trimmed = text.trim();
    if let Some(body) = trimmed.strip_prefix("```") {
        let body = body.split_once('\n').map_or("", |(_, rest)| rest);
        let body = body.trim_end().strip_suffix("```").unwrap_or(body);
        return body.trim().to_string();
    }
    trimmed.to_string()
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder().timeout(timeout).build().map_err(|error| AdapterError::Request {
        provider: "http",
        message: error.to_string(),
    })
}
