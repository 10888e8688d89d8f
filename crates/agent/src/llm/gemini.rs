//! Google Gemini adapter (native schema-constrained decoding).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use dbi_core::config::ProviderEndpoint;

use super::structured::{parse_json_output, validate_against_schema};
use super::{
    http_client, sanitize, Effort, ImageInput, ProviderAdapter, ProviderKind, Role,
    StructuredOptions, TextOptions,
};
use crate::errors::AdapterError;

const PROVIDER: &str = "gemini";

pub struct GeminiAdapter {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(api_key: SecretString, base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self { client: http_client(timeout)?, api_key, base_url: base_url.into() })
    }

    pub fn from_endpoint(endpoint: &ProviderEndpoint, timeout: Duration) -> Result<Self, AdapterError> {
        let api_key = endpoint.api_key.clone().ok_or(AdapterError::Unavailable(ProviderKind::Gemini))?;
        Self::new(api_key, endpoint.base_url.clone(), timeout)
    }

    fn url(&self, model: &str, action: &str) -> String {
        format!("{}/models/{model}:{action}", self.base_url.trim_end_matches('/'))
    }

    async fn post<B: Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        body: &B,
    ) -> Result<R, AdapterError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| AdapterError::Request { provider: PROVIDER, message: error.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GeminiError>(&body)
                .map(|error| error.error.message)
                .unwrap_or(body);
            return Err(AdapterError::Status { provider: PROVIDER, status: status.as_u16(), message });
        }

        response.json::<R>().await.map_err(|error| AdapterError::InvalidResponse {
            provider: PROVIDER,
            message: error.to_string(),
        })
    }

    async fn generate(&self, model: &str, request: &GeminiRequest) -> Result<String, AdapterError> {
        let response: GeminiResponse = self.post(self.url(model, "generateContent"), request).await?;
        extract_text(response)
    }
}

pub(crate) fn thinking_budget(effort: Effort) -> u32 {
    match effort {
        Effort::Low => 1024,
        Effort::Medium => 8192,
        Effort::High => 24576,
    }
}

fn text_part(text: impl Into<String>) -> GeminiPart {
    GeminiPart { text: Some(text.into()), ..GeminiPart::default() }
}

pub(crate) fn image_part(image: &ImageInput) -> GeminiPart {
    match image {
        ImageInput::Inline { mime_type, data } => GeminiPart {
            inline_data: Some(GeminiBlob { mime_type: mime_type.clone(), data: data.clone() }),
            ..GeminiPart::default()
        },
        ImageInput::Remote { url } => GeminiPart {
            file_data: Some(GeminiFileData { mime_type: guess_mime_type(url), file_uri: url.clone() }),
            ..GeminiPart::default()
        },
    }
}

fn guess_mime_type(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let mime = if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    };
    mime.to_string()
}

pub(crate) fn build_text_request(prompt: &str, options: &TextOptions) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = options
        .history
        .iter()
        .map(|turn| GeminiContent {
            role: match turn.role {
                Role::User => "user".to_string(),
                Role::Assistant => "model".to_string(),
            },
            parts: vec![text_part(turn.content.clone())],
        })
        .collect();
    contents.push(GeminiContent { role: "user".to_string(), parts: vec![text_part(prompt)] });

    GeminiRequest {
        contents,
        system_instruction: options
            .system_instruction
            .as_ref()
            .map(|instruction| GeminiSystemInstruction { parts: vec![text_part(instruction.clone())] }),
        generation_config: Some(GeminiGenerationConfig {
            thinking_config: Some(GeminiThinkingConfig {
                thinking_budget: thinking_budget(options.effort),
            }),
            ..GeminiGenerationConfig::default()
        }),
    }
}

/// Decodes a schema-constrained `generateContent` response into the validated value.
pub(crate) fn decode_structured(response: GeminiResponse, schema: &Value) -> Result<Value, AdapterError> {
    let text = extract_text(response)?;
    let value = parse_json_output(PROVIDER, &text)?;
    validate_against_schema(schema, &value)?;
    Ok(value)
}

fn extract_text(response: GeminiResponse) -> Result<String, AdapterError> {
    let candidate = response.candidates.into_iter().next().ok_or(AdapterError::InvalidResponse {
        provider: PROVIDER,
        message: "no candidates returned".to_string(),
    })?;

    Ok(candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| !part.thought.unwrap_or(false))
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default())
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    #[instrument(skip(self, prompt, options), fields(provider = PROVIDER, model = %model))]
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        options: &TextOptions,
    ) -> Result<String, AdapterError> {
        debug!(history = options.history.len(), "generating text");
        let text = self.generate(model, &build_text_request(prompt, options)).await?;
        Ok(if options.sanitize { sanitize(&text) } else { text })
    }

    #[instrument(skip(self, prompt, schema, options), fields(provider = PROVIDER, model = %model))]
    async fn generate_structured(
        &self,
        model: &str,
        prompt: &str,
        schema: &Value,
        options: &StructuredOptions,
    ) -> Result<Value, AdapterError> {
        let text_options = TextOptions {
            system_instruction: options.structuring_instruction.clone(),
            effort: options.reasoning_effort.unwrap_or_default(),
            ..TextOptions::default()
        };
        let mut request = build_text_request(prompt, &text_options);
        if let Some(config) = request.generation_config.as_mut() {
            config.response_mime_type = Some("application/json".to_string());
            config.response_json_schema = Some(schema.clone());
        }

        let response: GeminiResponse = self.post(self.url(model, "generateContent"), &request).await?;
        decode_structured(response, schema)
    }

    #[instrument(skip(self, image, prompt), fields(provider = PROVIDER, model = %model, image = image.tag()))]
    async fn generate_vision(
        &self,
        model: &str,
        image: &ImageInput,
        prompt: &str,
    ) -> Result<String, AdapterError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![image_part(image), text_part(prompt)],
            }],
            system_instruction: None,
            generation_config: None,
        };
        self.generate(model, &request).await
    }

    #[instrument(skip(self, text), fields(provider = PROVIDER, model = %model))]
    async fn generate_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>, AdapterError> {
        let request = GeminiEmbedRequest {
            content: GeminiContent { role: "user".to_string(), parts: vec![text_part(text)] },
        };
        let response: GeminiEmbedResponse = self.post(self.url(model, "embedContent"), &request).await?;
        Ok(response.embedding.values)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<GeminiFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_json_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    thinking_budget: u32,
}

#[derive(Deserialize)]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiEmbedResponse {
    embedding: GeminiEmbedding,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Deserialize)]
struct GeminiErrorDetail {
    message: String,
}
