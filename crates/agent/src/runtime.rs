//! Shared base for every actor: provider calls with a logging envelope, durable
//! conversation state, lifecycle writes and the tool set.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use dbi_core::domain::request::{LogLevel, RequestId, RequestStatus};
use dbi_db::{ActorStateRepository, RepositoryError};

use crate::actor::ActorId;
use crate::errors::{AdapterError, AgentError};
use crate::journal::RequestJournal;
use crate::knowledge::{core_tools, DurableKnowledgeStore};
use crate::llm::{
    Effort, ImageInput, ModelDefaults, ProviderKind, ProviderRegistry, StructuredOptions,
    TextOptions, Turn,
};
use crate::tools::{ToolRegistry, TracingToolSink};

const STATE_NAMESPACE: &str = "agent";
const MAX_HISTORY_TURNS: usize = 40;
const DESCRIBE_IMAGE_PROMPT: &str =
    "Describe this image in exhaustive detail. Include every visible label, number and piece of text.";

/// Collaborators shared by every actor instance.
#[derive(Clone)]
pub struct AgentDeps {
    pub providers: Arc<ProviderRegistry>,
    pub state: Arc<dyn ActorStateRepository>,
    pub journal: RequestJournal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub completed_requests: BTreeSet<String>,
    /// Correlation handle for an external engagement this actor works under.
    #[serde(default)]
    pub engagement_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Generating,
}

pub struct AgentRuntime {
    id: ActorId,
    deps: AgentDeps,
    tools: ToolRegistry,
    state: AgentState,
    loaded: bool,
    phase: Phase,
    text_effort: Effort,
}

impl AgentRuntime {
    /// `custom_tools` override core tools that share a name.
    pub fn new(id: ActorId, deps: AgentDeps, custom_tools: ToolRegistry) -> Self {
        let knowledge = Arc::new(DurableKnowledgeStore::new(Arc::clone(&deps.state), id.to_string()));
        let tools = ToolRegistry::union(&core_tools(knowledge), &custom_tools)
            .traced(Arc::new(TracingToolSink::new(id.to_string())));
        Self {
            id,
            deps,
            tools,
            state: AgentState::default(),
            loaded: false,
            phase: Phase::Idle,
            text_effort: Effort::Medium,
        }
    }

    /// Reasoning depth requested by [`AgentRuntime::generate_text`].
    pub fn with_text_effort(mut self, effort: Effort) -> Self {
        self.text_effort = effort;
        self
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.deps.providers
    }

    pub fn journal(&self) -> &RequestJournal {
        &self.deps.journal
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn set_engagement_id(&mut self, engagement_id: Option<String>) -> Result<(), AgentError> {
        self.ensure_loaded().await?;
        self.state.engagement_id = engagement_id;
        self.persist().await
    }

    pub async fn state(&mut self) -> Result<&AgentState, AgentError> {
        self.ensure_loaded().await?;
        Ok(&self.state)
    }

    async fn ensure_loaded(&mut self) -> Result<(), AgentError> {
        if self.loaded {
            return Ok(());
        }
        let key = self.id.to_string();
        if let Some(value) = self.deps.state.load(STATE_NAMESPACE, &key).await? {
            self.state = serde_json::from_value(value)
                .map_err(|error| RepositoryError::Decode(format!("agent state for `{key}`: {error}")))?;
        }
        self.loaded = true;
        Ok(())
    }

    async fn persist(&self) -> Result<(), AgentError> {
        let key = self.id.to_string();
        let value = serde_json::to_value(&self.state)
            .map_err(|error| RepositoryError::Decode(format!("agent state for `{key}`: {error}")))?;
        self.deps.state.save(STATE_NAMESPACE, &key, value).await?;
        Ok(())
    }

    fn resolve_model(
        &self,
        kind: ProviderKind,
        model: Option<&str>,
        pick: fn(&ModelDefaults) -> &str,
    ) -> Result<String, AdapterError> {
        match model {
            Some(model) => Ok(model.to_string()),
            None => Ok(pick(self.deps.providers.models(kind)?).to_string()),
        }
    }

    fn finish<T>(
        &mut self,
        operation: &'static str,
        kind: ProviderKind,
        started: Instant,
        outcome: Result<T, AdapterError>,
    ) -> Result<T, AgentError> {
        self.phase = Phase::Idle;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                info!(
                    event_name = "agent.generation.completed",
                    actor_id = %self.id,
                    engagement_id = self.state.engagement_id.as_deref(),
                    operation,
                    provider = kind.as_str(),
                    elapsed_ms,
                    "provider call completed"
                );
                Ok(value)
            }
            Err(failure) => {
                error!(
                    event_name = "agent.generation.failed",
                    actor_id = %self.id,
                    engagement_id = self.state.engagement_id.as_deref(),
                    operation,
                    provider = kind.as_str(),
                    elapsed_ms,
                    error = %failure,
                    "provider call failed"
                );
                Err(failure.into())
            }
        }
    }

    fn begin(&mut self, operation: &'static str, kind: ProviderKind, model: &str) -> Instant {
        self.phase = Phase::Generating;
        info!(
            event_name = "agent.generation.started",
            actor_id = %self.id,
            engagement_id = self.state.engagement_id.as_deref(),
            operation,
            provider = kind.as_str(),
            model,
            "provider call started"
        );
        Instant::now()
    }

    /// Conversational call; the prompt and answer are appended to history.
    pub async fn generate_text(
        &mut self,
        prompt: &str,
        provider: Option<ProviderKind>,
        model: Option<&str>,
        system_instruction: Option<&str>,
    ) -> Result<String, AgentError> {
        self.ensure_loaded().await?;
        let kind = provider.unwrap_or(self.deps.providers.bindings().text);
        let adapter = self.deps.providers.adapter(kind)?;
        let model = self.resolve_model(kind, model, |models| models.text.as_str())?;
        let options = TextOptions {
            system_instruction: system_instruction.map(str::to_string),
            history: self.state.history.clone(),
            effort: self.text_effort,
            sanitize: true,
        };

        let started = self.begin("generate_text", kind, &model);
        let outcome = adapter.generate_text(&model, prompt, &options).await;
        let text = self.finish("generate_text", kind, started, outcome)?;

        self.state.history.push(Turn::user(prompt));
        self.state.history.push(Turn::assistant(text.clone()));
        let excess = self.state.history.len().saturating_sub(MAX_HISTORY_TURNS);
        self.state.history.drain(..excess);
        self.persist().await?;
        Ok(text)
    }

    /// Side query; history is left untouched.
    pub async fn generate_structured(
        &mut self,
        prompt: &str,
        schema: &Value,
        provider: Option<ProviderKind>,
        model: Option<&str>,
        options: &StructuredOptions,
    ) -> Result<Value, AgentError> {
        let kind = provider.unwrap_or(self.deps.providers.bindings().text);
        let adapter = self.deps.providers.adapter(kind)?;
        let model = self.resolve_model(kind, model, |models| models.text.as_str())?;

        let started = self.begin("generate_structured", kind, &model);
        let outcome = adapter.generate_structured(&model, prompt, schema, options).await;
        self.finish("generate_structured", kind, started, outcome)
    }

    pub async fn analyze_image(
        &mut self,
        image: &ImageInput,
        prompt: &str,
        provider: Option<ProviderKind>,
        model: Option<&str>,
    ) -> Result<String, AgentError> {
        let kind = provider.unwrap_or(self.deps.providers.bindings().vision);
        let adapter = self.deps.providers.adapter(kind)?;
        let model = self.resolve_model(kind, model, |models| models.vision.as_str())?;

        let started = self.begin("analyze_image", kind, &model);
        let outcome = adapter.generate_vision(&model, image, prompt).await;
        self.finish("analyze_image", kind, started, outcome)
    }

    /// Describes the image with the vision binding, then structures the description
    /// with the text binding.
    pub async fn analyze_image_structured(
        &mut self,
        image: &ImageInput,
        prompt: &str,
        schema: &Value,
        options: &StructuredOptions,
    ) -> Result<Value, AgentError> {
        let description = self.analyze_image(image, DESCRIBE_IMAGE_PROMPT, None, None).await?;
        let structuring_prompt = format!("{prompt}\n\nImage description:\n{description}");
        self.generate_structured(&structuring_prompt, schema, None, None, options).await
    }

    pub async fn embed(&mut self, text: &str) -> Result<Vec<f32>, AgentError> {
        let kind = self.deps.providers.bindings().embedding;
        let adapter = self.deps.providers.adapter(kind)?;
        let model = self.resolve_model(kind, None, |models| models.embedding.as_str())?;
        let expected = self.deps.providers.embedding_dimensions();

        let started = self.begin("embed", kind, &model);
        let outcome = adapter.generate_embedding(&model, text).await.and_then(|vector| {
            if vector.len() == expected {
                Ok(vector)
            } else {
                Err(AdapterError::DimensionMismatch { expected, actual: vector.len() })
            }
        });
        self.finish("embed", kind, started, outcome)
    }

    pub async fn log_request(&self, request_id: &RequestId, level: LogLevel, message: &str, data: Option<Value>) {
        self.deps.journal.log(request_id, level, message, data).await;
    }

    pub async fn progress(&self, request_id: &RequestId, fraction: f64, stats: Option<Value>) {
        self.deps.journal.progress(request_id, fraction, stats).await;
    }

    pub async fn status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        error_text: Option<String>,
    ) -> Result<(), AgentError> {
        self.deps.journal.status(request_id, status, error_text).await
    }

    pub async fn has_completed(&mut self, request_id: &RequestId) -> Result<bool, AgentError> {
        self.ensure_loaded().await?;
        Ok(self.state.completed_requests.contains(request_id.as_str()))
    }

    pub async fn mark_completed(&mut self, request_id: &RequestId) -> Result<(), AgentError> {
        self.ensure_loaded().await?;
        self.state.completed_requests.insert(request_id.as_str().to_string());
        self.persist().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by runtime, worker and orchestrator tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::Value;

    use dbi_db::{InMemoryActorStateRepository, InMemoryRequestRepository};

    use super::AgentDeps;
    use crate::errors::AdapterError;
    use crate::journal::{EventHub, RequestJournal};
    use crate::llm::{
        Bindings, Effort, ImageInput, ModelDefaults, ProviderAdapter, ProviderKind, ProviderRegistry,
        StructuredOptions, TextOptions,
    };

    #[derive(Default)]
    pub struct ScriptedProvider {
        pub texts: Mutex<VecDeque<Result<String, String>>>,
        pub structured: Mutex<VecDeque<Value>>,
        pub embedding: Vec<f32>,
        pub text_prompts: Mutex<Vec<(String, usize)>>,
        pub text_efforts: Mutex<Vec<Effort>>,
        pub structured_prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn with_texts(texts: &[&str]) -> Self {
            Self {
                texts: Mutex::new(texts.iter().map(|text| Ok(text.to_string())).collect()),
                ..Self::default()
            }
        }

        pub fn push_structured(&self, value: Value) {
            self.structured.lock().expect("structured lock").push_back(value);
        }

        pub fn push_text_failure(&self, message: &str) {
            self.texts.lock().expect("texts lock").push_back(Err(message.to_string()));
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn generate_text(
            &self,
            _model: &str,
            prompt: &str,
            options: &TextOptions,
        ) -> Result<String, AdapterError> {
            self.text_prompts.lock().expect("prompts lock").push((prompt.to_string(), options.history.len()));
            self.text_efforts.lock().expect("efforts lock").push(options.effort);
            match self.texts.lock().expect("texts lock").pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(AdapterError::Status { provider: "scripted", status: 503, message }),
                None => Ok(String::new()),
            }
        }

        async fn generate_structured(
            &self,
            _model: &str,
            prompt: &str,
            _schema: &Value,
            _options: &StructuredOptions,
        ) -> Result<Value, AdapterError> {
            self.structured_prompts.lock().expect("prompts lock").push(prompt.to_string());
            self.structured.lock().expect("structured lock").pop_front().ok_or(AdapterError::InvalidResponse {
                provider: "scripted",
                message: "no structured output scripted".to_string(),
            })
        }

        async fn generate_vision(
            &self,
            _model: &str,
            image: &ImageInput,
            _prompt: &str,
        ) -> Result<String, AdapterError> {
            Ok(format!("a {} image of a permit placard", image.tag()))
        }

        async fn generate_embedding(&self, _model: &str, _text: &str) -> Result<Vec<f32>, AdapterError> {
            Ok(self.embedding.clone())
        }
    }

    pub fn registry(provider: Arc<ScriptedProvider>, dimensions: usize) -> Arc<ProviderRegistry> {
        let kind = ProviderKind::OpenAi;
        let mut registry = ProviderRegistry::new(Bindings { text: kind, vision: kind, embedding: kind }, dimensions);
        registry.register(
            provider,
            ModelDefaults {
                text: "scripted-text".to_string(),
                vision: "scripted-vision".to_string(),
                embedding: "scripted-embed".to_string(),
            },
        );
        Arc::new(registry)
    }

    pub fn deps(provider: Arc<ScriptedProvider>) -> AgentDeps {
        AgentDeps {
            providers: registry(provider, 3),
            state: Arc::new(InMemoryActorStateRepository::default()),
            journal: RequestJournal::new(Arc::new(InMemoryRequestRepository::default()), EventHub::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::testing::{deps, ScriptedProvider};
    use super::{AgentRuntime, Phase};
    use crate::actor::ActorId;
    use crate::errors::{AdapterError, AgentError};
    use crate::llm::{Effort, ImageInput, ProviderKind, StructuredOptions};
    use crate::tools::ToolRegistry;

    fn runtime(provider: Arc<ScriptedProvider>) -> AgentRuntime {
        AgentRuntime::new(ActorId::new("analyst", "req-1"), deps(provider), ToolRegistry::default())
    }

    #[tokio::test]
    async fn text_turns_accumulate_and_survive_reload() {
        let provider = Arc::new(ScriptedProvider::with_texts(&["first answer", "second answer"]));
        let shared = deps(provider.clone());
        let mut agent = AgentRuntime::new(ActorId::new("analyst", "req-1"), shared.clone(), ToolRegistry::default());

        agent.generate_text("first question", None, None, None).await.expect("first");
        agent.generate_text("second question", None, None, None).await.expect("second");
        assert_eq!(agent.phase(), Phase::Idle);

        let prompts = provider.text_prompts.lock().expect("prompts").clone();
        assert_eq!(prompts, vec![("first question".to_string(), 0), ("second question".to_string(), 2)]);

        let mut reopened = AgentRuntime::new(ActorId::new("analyst", "req-1"), shared.clone(), ToolRegistry::default());
        assert_eq!(reopened.state().await.expect("state").history.len(), 4);

        let mut stranger = AgentRuntime::new(ActorId::new("analyst", "req-2"), shared, ToolRegistry::default());
        assert!(stranger.state().await.expect("state").history.is_empty());
    }

    #[tokio::test]
    async fn engagement_handle_survives_reload() {
        let shared = deps(Arc::new(ScriptedProvider::with_texts(&["noted"])));
        let mut agent = AgentRuntime::new(ActorId::new("analyst", "req-1"), shared.clone(), ToolRegistry::default());
        assert_eq!(agent.state().await.expect("state").engagement_id, None);

        agent.set_engagement_id(Some("eng-204".to_string())).await.expect("set");
        agent.generate_text("status?", None, None, None).await.expect("text");

        let mut reopened = AgentRuntime::new(ActorId::new("analyst", "req-1"), shared, ToolRegistry::default());
        let state = reopened.state().await.expect("state");
        assert_eq!(state.engagement_id.as_deref(), Some("eng-204"));
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn text_effort_defaults_to_medium_and_can_be_raised() {
        let provider = Arc::new(ScriptedProvider::with_texts(&["a", "b"]));
        let mut plain = runtime(provider.clone());
        plain.generate_text("one", None, None, None).await.expect("plain");

        let mut deep = AgentRuntime::new(ActorId::new("analyst", "req-3"), deps(provider.clone()), ToolRegistry::default())
            .with_text_effort(Effort::High);
        deep.generate_text("two", None, None, None).await.expect("deep");

        let efforts = provider.text_efforts.lock().expect("efforts").clone();
        assert_eq!(efforts, vec![Effort::Medium, Effort::High]);
    }

    #[tokio::test]
    async fn failed_generation_propagates_and_leaves_history_alone() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_text_failure("upstream overloaded");
        let mut agent = runtime(provider);

        let error = agent.generate_text("hello", None, None, None).await.expect_err("fails");
        assert!(error.to_string().contains("upstream overloaded"));
        assert_eq!(agent.phase(), Phase::Idle);
        assert!(agent.state().await.expect("state").history.is_empty());
    }

    #[tokio::test]
    async fn structured_calls_do_not_touch_history() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_structured(json!({"summary": "ok"}));
        let mut agent = runtime(provider);

        let value = agent
            .generate_structured("summarize", &json!({"type": "object"}), None, None, &StructuredOptions::default())
            .await
            .expect("structured");
        assert_eq!(value, json!({"summary": "ok"}));
        assert!(agent.state().await.expect("state").history.is_empty());
    }

    #[tokio::test]
    async fn image_structuring_feeds_the_description_forward() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_structured(json!({"kind": "placard"}));
        let mut agent = runtime(provider.clone());

        let image = ImageInput::Remote { url: "https://x.test/p.jpg".to_string() };
        agent
            .analyze_image_structured(&image, "Extract the permit", &json!({"type": "object"}), &StructuredOptions::default())
            .await
            .expect("structured image");

        let prompts = provider.structured_prompts.lock().expect("prompts").clone();
        assert!(prompts[0].contains("a remote image of a permit placard"));
    }

    #[tokio::test]
    async fn embedding_dimensions_are_enforced() {
        let provider = Arc::new(ScriptedProvider { embedding: vec![0.1, 0.2], ..ScriptedProvider::default() });
        let mut agent = runtime(provider);

        let error = agent.embed("text").await.expect_err("wrong width");
        assert!(matches!(error, AgentError::Adapter(AdapterError::DimensionMismatch { expected: 3, actual: 2 })));
    }

    #[tokio::test]
    async fn unbound_providers_are_reported() {
        let mut agent = runtime(Arc::new(ScriptedProvider::default()));
        let error = agent.generate_text("hi", Some(ProviderKind::Gemini), None, None).await.expect_err("no gemini");
        assert_eq!(error.to_string(), "provider `gemini` is not configured");
    }

    #[tokio::test]
    async fn core_tools_are_always_present() {
        let agent = runtime(Arc::new(ScriptedProvider::default()));
        assert_eq!(agent.tools().names(), vec!["get_context", "search_knowledge", "store_fact"]);
    }

    #[tokio::test]
    async fn completion_marks_persist() {
        let shared = deps(Arc::new(ScriptedProvider::default()));
        let id = dbi_core::domain::request::RequestId("req-9".to_string());
        let mut agent = AgentRuntime::new(ActorId::new("data_fetch", "req-9"), shared.clone(), ToolRegistry::default());
        assert!(!agent.has_completed(&id).await.expect("check"));
        agent.mark_completed(&id).await.expect("mark");

        let mut reopened = AgentRuntime::new(ActorId::new("data_fetch", "req-9"), shared, ToolRegistry::default());
        assert!(reopened.has_completed(&id).await.expect("check"));
    }
}
