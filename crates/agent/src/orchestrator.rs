//! Request lifecycle: accept, classify, route to workers, and finish with a terminal status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use dbi_core::domain::event::LifecycleEvent;
use dbi_core::domain::payload::{JobMode, JobPayload};
use dbi_core::domain::request::{LogLevel, Request, RequestId, RequestStatus};
use dbi_core::errors::DomainError;

use crate::actor::{ActorDirectory, ActorId};
use crate::errors::AgentError;
use crate::journal::RequestJournal;
use crate::llm::{Effort, StructuredOptions};
use crate::runtime::{AgentDeps, AgentRuntime};
use crate::tools::ToolRegistry;

/// Words that hint a plain data pull is really an analytical question.
const ANALYTICAL_HINTS: [&str; 14] = [
    "why", "trend", "insight", "analy", "anomal", "unusual", "pattern", "compare", "average",
    "most", "least", "top", "outlier", "spike",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAck {
    pub request_id: RequestId,
    pub status: RequestStatus,
}

/// Decides the real mode of a data pull whose query reads like analysis.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, request_id: &RequestId, query: &str) -> Result<JobMode, AgentError>;
}

pub fn suggests_analysis(query: &str) -> bool {
    let lowered = query.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .any(|token| ANALYTICAL_HINTS.iter().any(|hint| token.starts_with(hint)))
}

/// Classifies with one structured call on the text binding.
pub struct LlmIntentClassifier {
    deps: AgentDeps,
}

impl LlmIntentClassifier {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["data_pull", "analyst", "insights", "anomalies"]}
            },
            "required": ["mode"]
        })
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, request_id: &RequestId, query: &str) -> Result<JobMode, AgentError> {
        let mut runtime =
            AgentRuntime::new(ActorId::new("intent", request_id.as_str()), self.deps.clone(), ToolRegistry::default());
        let prompt = format!(
            "Classify this request about San Francisco permit data. Use `data_pull` when the user only \
             wants records, `analyst` for a direct question, `insights` for patterns across records and \
             `anomalies` for unusual records.\n\nRequest: {query}"
        );
        let options = StructuredOptions { reasoning_effort: Some(Effort::Low), structuring_instruction: None };
        let value = runtime.generate_structured(&prompt, &Self::schema(), None, None, &options).await?;

        let label = value.get("mode").and_then(Value::as_str).unwrap_or_default();
        JobMode::parse(label)
            .ok_or_else(|| AgentError::Invariant(format!("intent classifier returned unknown mode `{label}`")))
    }
}

struct Inner {
    journal: RequestJournal,
    directory: ActorDirectory,
    classifier: Arc<dyn IntentClassifier>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(journal: RequestJournal, directory: ActorDirectory, classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { inner: Arc::new(Inner { journal, directory, classifier }) }
    }

    pub fn journal(&self) -> &RequestJournal {
        &self.inner.journal
    }

    /// Every lifecycle event of every request, from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.journal.hub().subscribe()
    }

    /// Records the request as queued and schedules the run in the background.
    pub async fn start(&self, request_id: Option<RequestId>, payload: JobPayload) -> Result<StartAck, AgentError> {
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        let mode = payload.validate()?;

        let created = self.inner.journal.create(Request::queued(request_id.clone(), mode.as_str())).await?;
        if !created {
            return Err(DomainError::InvalidPayload(format!("request `{request_id}` already exists")).into());
        }
        info!(
            event_name = "orchestrator.request.queued",
            request_id = %request_id,
            mode = mode.as_str(),
            "request queued"
        );

        let this = self.clone();
        let background_id = request_id.clone();
        tokio::spawn(async move {
            if let Err(failure) = this.run(&background_id, payload).await {
                error!(
                    event_name = "orchestrator.run.unrecorded",
                    request_id = %background_id,
                    error = %failure,
                    "run failed before a terminal status could be recorded"
                );
            }
        });

        Ok(StartAck { request_id, status: RequestStatus::Queued })
    }

    /// Drives one request to a terminal status and returns it.
    pub async fn run(&self, request_id: &RequestId, payload: JobPayload) -> Result<RequestStatus, AgentError> {
        let journal = &self.inner.journal;
        let request = journal
            .find(request_id)
            .await?
            .ok_or_else(|| AgentError::Invariant(format!("request `{request_id}` does not exist")))?;

        if request.status.is_terminal() {
            warn!(
                event_name = "orchestrator.run.skipped",
                request_id = %request_id,
                status = request.status.as_str(),
                "request already finished; not running again"
            );
            return Ok(request.status);
        }

        if request.status == RequestStatus::Queued {
            if let Err(invalid) = payload.validate() {
                let message = AgentError::from(invalid).to_string();
                journal.log(request_id, LogLevel::Error, &message, None).await;
                journal.status(request_id, RequestStatus::Error, Some(message)).await?;
                return Ok(RequestStatus::Error);
            }
            journal.status(request_id, RequestStatus::Running, None).await?;
        }
        info!(event_name = "orchestrator.run.started", request_id = %request_id, "run started");

        let outcome = self.dispatch(request_id, payload).await;
        self.inner.directory.release(request_id).await;

        match outcome {
            Ok(()) => {
                journal.progress(request_id, 1.0, None).await;
                journal.status(request_id, RequestStatus::Complete, None).await?;
                info!(event_name = "orchestrator.run.completed", request_id = %request_id, "run completed");
                Ok(RequestStatus::Complete)
            }
            Err(failure) => {
                let message = failure.to_string();
                error!(
                    event_name = "orchestrator.run.failed",
                    request_id = %request_id,
                    error = %message,
                    "run failed"
                );
                journal
                    .log(request_id, LogLevel::Error, &message, Some(json!({ "error": format!("{failure:?}") })))
                    .await;
                journal.status(request_id, RequestStatus::Error, Some(message)).await?;
                Ok(RequestStatus::Error)
            }
        }
    }

    async fn dispatch(&self, request_id: &RequestId, payload: JobPayload) -> Result<(), AgentError> {
        let journal = &self.inner.journal;
        let mut payload = payload;

        if payload.validate()? == JobMode::DataPull {
            if let Some(query) = payload.query_text().filter(|query| suggests_analysis(query)) {
                let mode = self.inner.classifier.classify(request_id, query).await?;
                if mode != JobMode::DataPull {
                    journal
                        .log(
                            request_id,
                            LogLevel::Info,
                            &format!("query reclassified as {}", mode.as_str()),
                            Some(json!({ "mode": mode.as_str() })),
                        )
                        .await;
                    payload = payload.with_mode(mode);
                }
            }
        }

        let chain = payload.route()?;
        for kind in chain {
            journal
                .log(request_id, LogLevel::Info, &format!("dispatching to {}", kind.as_str()), None)
                .await;
            self.inner.directory.dispatch(kind, request_id, &payload).await?;
        }
        Ok(())
    }

    /// Reply for an inbound observer frame.
    pub fn handle_inbound(&self, text: &str) -> String {
        let trimmed = text.trim();
        let is_ping = trimmed.eq_ignore_ascii_case("ping")
            || serde_json::from_str::<Value>(trimmed)
                .ok()
                .and_then(|value| value.get("type").and_then(Value::as_str).map(|kind| kind == "ping"))
                .unwrap_or(false);
        let kind = if is_ping { "pong" } else { "ack" };
        json!({ "type": kind, "ts": Utc::now() }).to_string()
    }
}
