//! Cloudflare Workers AI adapter. Structured output goes through the two-phase pipeline.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use dbi_core::config::ProviderEndpoint;

use super::structured::{parse_json_output, two_phase, JsonStructurer};
use super::{
    http_client, sanitize, Effort, ImageInput, ProviderAdapter, ProviderKind, Role,
    StructuredOptions, TextOptions,
};
use crate::errors::AdapterError;

const PROVIDER: &str = "worker-ai";

pub struct WorkersAiAdapter {
    client: Client,
    api_key: SecretString,
    base_url: String,
    account_id: String,
}

impl WorkersAiAdapter {
    pub fn new(
        api_key: SecretString,
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            base_url: base_url.into(),
            account_id: account_id.into(),
        })
    }

    pub fn from_endpoint(endpoint: &ProviderEndpoint, timeout: Duration) -> Result<Self, AdapterError> {
        let unavailable = AdapterError::Unavailable(ProviderKind::WorkersAi);
        let api_key = endpoint.api_key.clone().ok_or(unavailable)?;
        let account_id = endpoint
            .account_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(AdapterError::Unavailable(ProviderKind::WorkersAi))?;
        Self::new(api_key, endpoint.base_url.clone(), account_id, timeout)
    }

    fn url(&self, model: &str) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            model.trim_start_matches('/')
        )
    }

    async fn run(&self, model: &str, body: &Value) -> Result<Value, AdapterError> {
        let response = self
            .client
            .post(self.url(model))
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| AdapterError::Request { provider: PROVIDER, message: error.to_string() })?;

        let status = response.status();
        let envelope = response.text().await.map_err(|error| AdapterError::Request {
            provider: PROVIDER,
            message: error.to_string(),
        })?;
        if !status.is_success() {
            let message = serde_json::from_str::<Envelope>(&envelope)
                .ok()
                .and_then(|decoded| decoded.first_error())
                .unwrap_or(envelope);
            return Err(AdapterError::Status { provider: PROVIDER, status: status.as_u16(), message });
        }

        let decoded: Envelope = serde_json::from_str(&envelope).map_err(|error| {
            AdapterError::InvalidResponse { provider: PROVIDER, message: error.to_string() }
        })?;
        if !decoded.success {
            return Err(AdapterError::InvalidResponse {
                provider: PROVIDER,
                message: decoded.first_error().unwrap_or_else(|| "request was not successful".to_string()),
            });
        }
        Ok(decoded.result)
    }

    async fn chat(&self, model: &str, body: Value) -> Result<Value, AdapterError> {
        let result = self.run(model, &body).await?;
        result.get("response").cloned().ok_or(AdapterError::InvalidResponse {
            provider: PROVIDER,
            message: "result has no `response` field".to_string(),
        })
    }

    /// Binds a model so the adapter can drive the two-phase pipeline.
    pub fn structurer<'a>(&'a self, model: &'a str) -> BoundStructurer<'a> {
        BoundStructurer { adapter: self, model }
    }
}

pub(crate) fn chat_messages(prompt: &str, options: &TextOptions) -> Vec<Value> {
    let mut messages = Vec::with_capacity(options.history.len() + 2);
    if let Some(instruction) = &options.system_instruction {
        messages.push(json!({"role": "system", "content": instruction}));
    }
    for turn in &options.history {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": turn.content}));
    }
    messages.push(json!({"role": "user", "content": prompt}));
    messages
}

/// Workers AI takes raw image bytes as an integer array; remote URLs are rejected.
pub(crate) fn image_bytes(image: &ImageInput) -> Result<Vec<u8>, AdapterError> {
    match image {
        ImageInput::Inline { data, .. } => STANDARD.decode(data.trim()).map_err(|error| {
            AdapterError::InvalidResponse { provider: PROVIDER, message: format!("invalid base64 image: {error}") }
        }),
        ImageInput::Remote { .. } => {
            Err(AdapterError::UnsupportedImage { provider: PROVIDER, tag: image.tag() })
        }
    }
}

fn response_text(response: Value) -> String {
    match response {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct BoundStructurer<'a> {
    adapter: &'a WorkersAiAdapter,
    model: &'a str,
}

#[async_trait]
impl JsonStructurer for BoundStructurer<'_> {
    async fn reason(&self, prompt: &str, _effort: Effort) -> Result<String, AdapterError> {
        let messages = chat_messages(prompt, &TextOptions::default());
        Ok(response_text(self.adapter.chat(self.model, json!({"messages": messages})).await?))
    }

    async fn structure(
        &self,
        analysis: &str,
        schema: &Value,
        instruction: &str,
    ) -> Result<Value, AdapterError> {
        let options = TextOptions { system_instruction: Some(instruction.to_string()), ..TextOptions::default() };
        let body = json!({
            "messages": chat_messages(analysis, &options),
            "response_format": {"type": "json_schema", "json_schema": schema},
        });
        match self.adapter.chat(self.model, body).await? {
            Value::String(text) => parse_json_output(PROVIDER, &text),
            value => Ok(value),
        }
    }
}

#[async_trait]
impl ProviderAdapter for WorkersAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WorkersAi
    }

    #[instrument(skip(self, prompt, options), fields(provider = PROVIDER, model = %model))]
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        options: &TextOptions,
    ) -> Result<String, AdapterError> {
        debug!(history = options.history.len(), "generating text");
        let body = json!({"messages": chat_messages(prompt, options)});
        let text = response_text(self.chat(model, body).await?);
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
        two_phase(&self.structurer(model), prompt, schema, options).await
    }

    #[instrument(skip(self, image, prompt), fields(provider = PROVIDER, model = %model, image = image.tag()))]
    async fn generate_vision(
        &self,
        model: &str,
        image: &ImageInput,
        prompt: &str,
    ) -> Result<String, AdapterError> {
        let bytes = image_bytes(image)?;
        let body = json!({"prompt": prompt, "image": bytes});
        Ok(response_text(self.chat(model, body).await?))
    }

    #[instrument(skip(self, text), fields(provider = PROVIDER, model = %model))]
    async fn generate_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>, AdapterError> {
        let result = self.run(model, &json!({"text": [text]})).await?;
        let embedding: Option<Vec<f32>> = result
            .get("data")
            .and_then(|data| data.get(0))
            .and_then(|vector| serde_json::from_value(vector.clone()).ok());
        embedding.ok_or(AdapterError::InvalidResponse {
            provider: PROVIDER,
            message: "result has no embedding vector".to_string(),
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
}

impl Envelope {
    fn first_error(&self) -> Option<String> {
        self.errors.first().map(|error| error.message.clone())
    }
}

#[derive(Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{chat_messages, image_bytes, response_text};
    use crate::errors::AdapterError;
    use crate::llm::{ImageInput, TextOptions, Turn};

    #[test]
    fn remote_images_are_rejected() {
        let remote = ImageInput::Remote { url: "https://x.test/a.png".to_string() };
        assert!(matches!(
            image_bytes(&remote),
            Err(AdapterError::UnsupportedImage { tag: "remote", .. })
        ));
    }

    #[test]
    fn inline_images_decode_to_bytes() {
        let inline = ImageInput::Inline { mime_type: "image/png".to_string(), data: "aGk=".to_string() };
        assert_eq!(image_bytes(&inline).expect("bytes"), b"hi".to_vec());

        let broken = ImageInput::Inline { mime_type: "image/png".to_string(), data: "@@".to_string() };
        assert!(image_bytes(&broken).is_err());
    }

    #[test]
    fn messages_carry_system_and_history() {
        let options = TextOptions {
            system_instruction: Some("sys".to_string()),
            history: vec![Turn::user("earlier")],
            ..TextOptions::default()
        };
        let messages = chat_messages("now", &options);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(messages[2], json!({"role": "user", "content": "now"}));
    }

    #[test]
    fn non_string_responses_are_rendered_as_json() {
        assert_eq!(response_text(json!("plain")), "plain");
        assert_eq!(response_text(json!({"a": 1})), "{\"a\":1}");
        assert_eq!(response_text(json!(null)), "");
    }
}
