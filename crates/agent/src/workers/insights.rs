//! Turns freshly fetched rows into structured insights and anomalies.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use dbi_core::domain::payload::{JobPayload, WorkerKind};
use dbi_core::domain::request::{LogLevel, RequestId, RequestResult};

use crate::actor::{ActorId, Worker, WorkerFactory};
use crate::errors::AgentError;
use crate::llm::{Effort, StructuredOptions};
use crate::runtime::{AgentDeps, AgentRuntime};
use crate::tools::ToolRegistry;

pub const INSIGHT_ENTITY: &str = "insight";
pub const ANOMALY_ENTITY: &str = "anomaly";
pub const INSIGHTS_SOURCE: &str = "insights";
const SAMPLE_ROWS_PER_ENTITY: usize = 3;
const INSIGHTS_PROGRESS: f64 = 0.95;

#[derive(Debug, Deserialize)]
struct Findings {
    #[serde(default)]
    insights: Vec<Value>,
    #[serde(default)]
    anomalies: Vec<Value>,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct EntitySummary {
    pub rows: usize,
    pub samples: Vec<Value>,
}

/// Groups fetched rows by entity, keeping a few samples each. Prior findings are ignored.
pub(crate) fn summarize(results: &[RequestResult]) -> BTreeMap<String, EntitySummary> {
    let mut summaries: BTreeMap<String, EntitySummary> = BTreeMap::new();
    for result in results {
        if result.entity == INSIGHT_ENTITY || result.entity == ANOMALY_ENTITY {
            continue;
        }
        let summary = summaries.entry(result.entity.clone()).or_default();
        summary.rows += 1;
        if summary.samples.len() < SAMPLE_ROWS_PER_ENTITY {
            summary.samples.push(result.row.clone());
        }
    }
    summaries
}

pub(crate) fn findings_schema(with_anomalies: bool) -> Value {
    let finding = json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "detail": {"type": "string"},
            "entity": {"type": "string"}
        },
        "required": ["title", "detail"]
    });
    let mut schema = json!({
        "type": "object",
        "properties": {"insights": {"type": "array", "items": finding.clone()}},
        "required": ["insights"]
    });
    if with_anomalies {
        schema["properties"]["anomalies"] = json!({"type": "array", "items": finding});
        schema["required"] = json!(["insights", "anomalies"]);
    }
    schema
}

fn findings_prompt(payload: &JobPayload, summaries: &BTreeMap<String, EntitySummary>, with_anomalies: bool) -> String {
    let mut prompt = String::from(
        "You are reviewing San Francisco building permit and complaint records pulled for an analyst.\n",
    );
    if let Some(query) = payload.query_text() {
        prompt.push_str(&format!("The analyst asked: {query}\n"));
    }
    prompt.push_str("Record counts and samples by entity:\n");
    for (entity, summary) in summaries {
        let samples = serde_json::to_string(&summary.samples).unwrap_or_default();
        prompt.push_str(&format!("- {entity}: {} rows; samples: {samples}\n", summary.rows));
    }
    prompt.push_str("List the notable patterns as insights");
    if with_anomalies {
        prompt.push_str(" and separately list records or trends that look anomalous");
    }
    prompt.push('.');
    prompt
}

pub struct InsightsWorker {
    runtime: AgentRuntime,
}

impl InsightsWorker {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self { runtime }
    }

    async fn persist(&self, request_id: &RequestId, entity: &str, findings: Vec<Value>) -> Result<usize, AgentError> {
        let count = findings.len();
        for finding in findings {
            let result = RequestResult::new(request_id.clone(), entity, finding).with_source(INSIGHTS_SOURCE);
            self.runtime.journal().record_result(result).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl Worker for InsightsWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Insights
    }

    async fn run(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError> {
        if self.runtime.has_completed(request_id).await? {
            self.runtime
                .log_request(request_id, LogLevel::Info, "insights already completed; skipping", None)
                .await;
            return Ok(());
        }

        let results = self.runtime.journal().results(request_id).await?;
        let summaries = summarize(&results);
        if summaries.is_empty() {
            self.runtime
                .log_request(request_id, LogLevel::Info, "no fetched rows to analyse", None)
                .await;
            return self.runtime.mark_completed(request_id).await;
        }

        let with_anomalies = payload.wants_anomalies();
        self.runtime
            .log_request(
                request_id,
                LogLevel::Info,
                "generating insights",
                Some(json!({ "entities": summaries.keys().collect::<Vec<_>>(), "anomalies": with_anomalies })),
            )
            .await;

        let options = StructuredOptions { reasoning_effort: Some(Effort::High), structuring_instruction: None };
        let value = self
            .runtime
            .generate_structured(
                &findings_prompt(payload, &summaries, with_anomalies),
                &findings_schema(with_anomalies),
                None,
                None,
                &options,
            )
            .await?;
        let findings: Findings = serde_json::from_value(value)
            .map_err(|error| AgentError::Invariant(format!("insights output is malformed: {error}")))?;

        let insights = self.persist(request_id, INSIGHT_ENTITY, findings.insights).await?;
        let anomalies = if with_anomalies {
            self.persist(request_id, ANOMALY_ENTITY, findings.anomalies).await?
        } else {
            0
        };

        self.runtime
            .progress(request_id, INSIGHTS_PROGRESS, Some(json!({ "insights": insights, "anomalies": anomalies })))
            .await;
        self.runtime.mark_completed(request_id).await
    }
}

pub struct InsightsFactory {
    pub deps: AgentDeps,
}

impl WorkerFactory for InsightsFactory {
    fn create(&self, id: &ActorId) -> Result<Box<dyn Worker>, AgentError> {
        let runtime = AgentRuntime::new(id.clone(), self.deps.clone(), ToolRegistry::default());
        Ok(Box::new(InsightsWorker::new(runtime)))
    }
}
