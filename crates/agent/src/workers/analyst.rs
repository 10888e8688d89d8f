//! Natural-language analyst: answers the payload's question conversationally.

use async_trait::async_trait;
use serde_json::json;

use dbi_core::domain::payload::{JobPayload, WorkerKind};
use dbi_core::domain::request::{LogLevel, RequestId, RequestResult};
use dbi_core::errors::DomainError;

use crate::actor::{ActorId, Worker, WorkerFactory};
use crate::errors::AgentError;
use crate::llm::Effort;
use crate::runtime::{AgentDeps, AgentRuntime};
use crate::tools::ToolRegistry;

pub const ANSWER_ENTITY: &str = "analyst_answer";
const ANALYST_SOURCE: &str = "analyst";
const ANALYST_INSTRUCTION: &str = "You are a data analyst for San Francisco building permits, \
     plumbing and electrical permits, addenda and complaints. Answer precisely and say when the \
     question cannot be answered from permit data.";

pub struct AnalystWorker {
    runtime: AgentRuntime,
}

impl AnalystWorker {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Worker for AnalystWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Analyst
    }

    async fn run(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError> {
        if self.runtime.has_completed(request_id).await? {
            self.runtime
                .log_request(request_id, LogLevel::Info, "analyst already answered; skipping", None)
                .await;
            return Ok(());
        }

        let question = payload
            .query_text()
            .ok_or_else(|| DomainError::InvalidPayload("analyst mode requires a query".to_string()))?;
        self.runtime.log_request(request_id, LogLevel::Info, "answering question", None).await;

        let answer = self.runtime.generate_text(question, None, None, Some(ANALYST_INSTRUCTION)).await?;
        let row = json!({ "question": question, "answer": answer });
        let result = RequestResult::new(request_id.clone(), ANSWER_ENTITY, row).with_source(ANALYST_SOURCE);
        self.runtime.journal().record_result(result).await?;

        self.runtime.progress(request_id, 0.9, Some(json!({ "answers": 1 }))).await;
        self.runtime.mark_completed(request_id).await
    }
}

pub struct AnalystFactory {
    pub deps: AgentDeps,
}

impl WorkerFactory for AnalystFactory {
    fn create(&self, id: &ActorId) -> Result<Box<dyn Worker>, AgentError> {
        let runtime = AgentRuntime::new(id.clone(), self.deps.clone(), ToolRegistry::default())
            .with_text_effort(Effort::High);
        Ok(Box::new(AnalystWorker::new(runtime)))
    }
}
