//! OpenAI-compatible chat completions adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use dbi_core::config::ProviderEndpoint;

use super::structured::{parse_json_output, validate_against_schema};
use super::{
    http_client, sanitize, Effort, ImageInput, ProviderAdapter, ProviderKind, Role,
    StructuredOptions, TextOptions,
};
use crate::errors::AdapterError;

const PROVIDER: &str = "openai";

pub struct OpenAiAdapter {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: SecretString, base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self { client: http_client(timeout)?, api_key, base_url: base_url.into() })
    }

    pub fn from_endpoint(endpoint: &ProviderEndpoint, timeout: Duration) -> Result<Self, AdapterError> {
        let api_key = endpoint.api_key.clone().ok_or(AdapterError::Unavailable(ProviderKind::OpenAi))?;
        Self::new(api_key, endpoint.base_url.clone(), timeout)
    }

    async fn post<B: Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AdapterError> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| AdapterError::Request { provider: PROVIDER, message: error.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|error| error.error.message)
                .unwrap_or(body);
            return Err(AdapterError::Status { provider: PROVIDER, status: status.as_u16(), message });
        }

        response.json::<R>().await.map_err(|error| AdapterError::InvalidResponse {
            provider: PROVIDER,
            message: error.to_string(),
        })
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, AdapterError> {
        let response: ChatResponse = self.post("chat/completions", request).await?;
        first_choice_text(response)
    }
}

fn first_choice_text(response: ChatResponse) -> Result<String, AdapterError> {
    let choice = response.choices.into_iter().next().ok_or(AdapterError::InvalidResponse {
        provider: PROVIDER,
        message: "no choices returned".to_string(),
    })?;
    Ok(choice.message.content.unwrap_or_default())
}

/// Decodes a `json_schema` chat completion into the validated value.
pub(crate) fn decode_structured(response: ChatResponse, schema: &Value) -> Result<Value, AdapterError> {
    let text = first_choice_text(response)?;
    let value = parse_json_output(PROVIDER, &text)?;
    validate_against_schema(schema, &value)?;
    Ok(value)
}

/// Only reasoning model families accept `reasoning_effort`.
pub(crate) fn accepts_reasoning_effort(model: &str) -> bool {
    let model = model.rsplit('/').next().unwrap_or(model);
    model.starts_with("gpt-5")
        || (model.starts_with('o') && model[1..].starts_with(|c: char| c.is_ascii_digit()))
}

pub(crate) fn image_url(image: &ImageInput) -> String {
    match image {
        ImageInput::Inline { mime_type, data } => format!("data:{mime_type};base64,{data}"),
        ImageInput::Remote { url } => url.clone(),
    }
}

pub(crate) fn build_chat_request(model: &str, prompt: &str, options: &TextOptions) -> ChatRequest {
    let mut messages = Vec::with_capacity(options.history.len() + 2);
    if let Some(instruction) = &options.system_instruction {
        messages.push(ChatMessage::text("system", instruction.clone()));
    }
    for turn in &options.history {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(ChatMessage::text(role, turn.content.clone()));
    }
    messages.push(ChatMessage::text("user", prompt.to_string()));

    ChatRequest {
        model: model.to_string(),
        messages,
        reasoning_effort: accepts_reasoning_effort(model).then(|| options.effort.as_str()),
        response_format: None,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    #[instrument(skip(self, prompt, options), fields(provider = PROVIDER, model = %model))]
    async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        options: &TextOptions,
    ) -> Result<String, AdapterError> {
        debug!(history = options.history.len(), "generating text");
        let text = self.complete(&build_chat_request(model, prompt, options)).await?;
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
            effort: options.reasoning_effort.unwrap_or(Effort::Medium),
            ..TextOptions::default()
        };
        let mut request = build_chat_request(model, prompt, &text_options);
        request.response_format = Some(json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema}
        }));

        let response: ChatResponse = self.post("chat/completions", &request).await?;
        decode_structured(response, schema)
    }

    #[instrument(skip(self, image, prompt), fields(provider = PROVIDER, model = %model, image = image.tag()))]
    async fn generate_vision(
        &self,
        model: &str,
        image: &ImageInput,
        prompt: &str,
    ) -> Result<String, AdapterError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: prompt.to_string() },
                    ContentPart::ImageUrl { image_url: ImageUrl { url: image_url(image) } },
                ]),
            }],
            reasoning_effort: None,
            response_format: None,
        };
        self.complete(&request).await
    }

    #[instrument(skip(self, text), fields(provider = PROVIDER, model = %model))]
    async fn generate_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>, AdapterError> {
        let response: EmbeddingResponse =
            self.post("embeddings", &json!({"model": model, "input": text})).await?;
        response.data.into_iter().next().map(|item| item.embedding).ok_or(
            AdapterError::InvalidResponse {
                provider: PROVIDER,
                message: "no embedding returned".to_string(),
            },
        )
    }
}

#[derive(Serialize)]
pub(crate) struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

impl ChatMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self { role, content: MessageContent::Text(content) }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{accepts_reasoning_effort, build_chat_request, decode_structured, image_url, ChatResponse};
    use crate::errors::AdapterError;
    use crate::llm::{Effort, ImageInput, TextOptions, Turn};

    #[test]
    fn reasoning_effort_is_sent_only_to_reasoning_models() {
        assert!(accepts_reasoning_effort("o3-mini"));
        assert!(accepts_reasoning_effort("gpt-5"));
        assert!(!accepts_reasoning_effort("gpt-4o-mini"));
        assert!(!accepts_reasoning_effort("omni"));

        let options = TextOptions { effort: Effort::Low, ..TextOptions::default() };
        let body = serde_json::to_value(build_chat_request("o4-mini", "hi", &options)).expect("serialize");
        assert_eq!(body["reasoning_effort"], "low");

        let body = serde_json::to_value(build_chat_request("gpt-4o-mini", "hi", &options)).expect("serialize");
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn history_precedes_prompt_after_system_message() {
        let options = TextOptions {
            system_instruction: Some("sys".to_string()),
            history: vec![Turn::user("q"), Turn::assistant("a")],
            ..TextOptions::default()
        };
        let body = serde_json::to_value(build_chat_request("gpt-4o-mini", "next", &options)).expect("serialize");
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter_map(|message| message["role"].as_str())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(body["messages"][3]["content"], "next");
    }

    #[test]
    fn inline_images_become_data_uris() {
        let inline = ImageInput::Inline { mime_type: "image/png".to_string(), data: "AAAA".to_string() };
        assert_eq!(image_url(&inline), "data:image/png;base64,AAAA");
        let remote = ImageInput::Remote { url: "https://x.test/a.jpg".to_string() };
        assert_eq!(image_url(&remote), "https://x.test/a.jpg");
    }

    #[test]
    fn structured_completion_decodes_in_one_call() {
        let response: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-9x",
            "object": "chat.completion",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "{\"mode\": \"analyst\"}",
                    "refusal": null
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 88, "completion_tokens": 6, "total_tokens": 94}
        }))
        .expect("decode");

        let schema = json!({"type": "object", "required": ["mode"], "properties": {"mode": {"enum": ["data_pull", "analyst"]}}});
        assert_eq!(decode_structured(response, &schema).expect("structured"), json!({"mode": "analyst"}));
    }

    #[test]
    fn completion_without_choices_is_invalid() {
        let response: ChatResponse = serde_json::from_value(json!({"id": "chatcmpl-0", "choices": []})).expect("decode");
        let error = decode_structured(response, &json!({"type": "object"})).expect_err("no choices");
        assert!(matches!(error, AdapterError::InvalidResponse { provider: "openai", .. }));
    }
}
