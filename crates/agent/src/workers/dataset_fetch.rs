//! Sweeps the selected open-data datasets page by page, or hands the request to
//! the bulk-analysis sandbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use dbi_core::config::SodaConfig;
use dbi_core::datasets::{self, DatasetSpec, CATALOG};
use dbi_core::domain::payload::{JobMode, JobPayload, WorkerKind};
use dbi_core::domain::request::{LogLevel, RequestId, RequestResult};
use dbi_core::query::{dataset_predicates, SoqlQuery};

use crate::actor::{ActorId, Worker, WorkerFactory};
use crate::errors::{AgentError, DatasetError, ToolError};
use crate::runtime::{AgentDeps, AgentRuntime};
use crate::tools::{Tool, ToolRegistry};
use crate::workers::sandbox::{parse_output, SandboxExecutor};
use crate::workers::soda::DatasetSource;

/// Share of overall progress the sweep may claim; the rest is reserved for completion.
pub const SWEEP_PROGRESS_CEILING: f64 = 0.9;
pub const DEFAULT_ROW_CAP: u64 = 20_000;

#[derive(Clone, Debug, PartialEq)]
pub struct FetchSettings {
    pub page_size: u32,
    pub row_cap: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self { page_size: 1000, row_cap: DEFAULT_ROW_CAP, max_retries: 1, retry_base_delay: Duration::from_millis(500) }
    }
}

impl From<&SodaConfig> for FetchSettings {
    fn from(config: &SodaConfig) -> Self {
        Self {
            page_size: config.page_size,
            row_cap: config.row_cap,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

pub struct DataFetchWorker {
    runtime: AgentRuntime,
    source: Arc<dyn DatasetSource>,
    sandbox: Arc<dyn SandboxExecutor>,
    settings: FetchSettings,
}

impl DataFetchWorker {
    pub fn new(
        runtime: AgentRuntime,
        source: Arc<dyn DatasetSource>,
        sandbox: Arc<dyn SandboxExecutor>,
        settings: FetchSettings,
    ) -> Self {
        Self { runtime, source, sandbox, settings }
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    async fn fetch_with_retry(&self, dataset: &DatasetSpec, query: &SoqlQuery) -> Result<Vec<Value>, DatasetError> {
        let mut attempt = 0;
        loop {
            match self.source.fetch_page(dataset, query).await {
                Ok(rows) => return Ok(rows),
                Err(error) if attempt < self.settings.max_retries => {
                    let delay = self.settings.retry_base_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        event_name = "worker.data_fetch.page_retry",
                        actor_id = %self.runtime.id(),
                        dataset = dataset.key,
                        offset = query.offset,
                        attempt = attempt + 1,
                        error = %error,
                        "page fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn sweep(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError> {
        let selected = datasets::select(payload);
        let total = selected.len().max(1) as f64;
        let page_size = payload.page_size.unwrap_or(self.settings.page_size).max(1);
        let row_cap = self.settings.row_cap;
        let mut fetched_total: u64 = 0;
        let mut per_dataset = Map::new();
        let mut capped = false;

        for (index, dataset) in selected.iter().enumerate() {
            let Some(predicates) = dataset_predicates(dataset, payload) else {
                self.runtime
                    .log_request(
                        request_id,
                        LogLevel::Info,
                        &format!("skipping {}: filters do not apply to this dataset", dataset.key),
                        None,
                    )
                    .await;
                continue;
            };

            self.runtime
                .log_request(request_id, LogLevel::Info, &format!("fetching {}", dataset.key), None)
                .await;
            let mut query = SoqlQuery::for_dataset(dataset, &predicates, page_size);
            let mut dataset_rows: u64 = 0;

            loop {
                let remaining = row_cap.saturating_sub(fetched_total);
                if remaining == 0 {
                    capped = true;
                    break;
                }
                let page = query.with_limit(remaining.min(u64::from(page_size)) as u32);
                let rows = self.fetch_with_retry(dataset, &page).await?;
                let count = rows.len() as u64;

                for row in rows {
                    let canonical_key = dataset.canonical_key(&row);
                    let result = RequestResult::new(request_id.clone(), dataset.entity, row)
                        .with_source(dataset.soda_id)
                        .with_canonical_key(canonical_key);
                    self.runtime.journal().record_result(result).await?;
                }
                fetched_total += count;
                dataset_rows += count;

                if count < u64::from(page.limit) {
                    break;
                }
                query = page.next_page(count);
            }

            per_dataset.insert(dataset.key.to_string(), json!(dataset_rows));
            let fraction = SWEEP_PROGRESS_CEILING * (index + 1) as f64 / total;
            let stats = json!({ "rows": fetched_total, "datasets": Value::Object(per_dataset.clone()) });
            self.runtime.progress(request_id, fraction, Some(stats)).await;

            if capped {
                warn!(
                    event_name = "worker.data_fetch.row_cap_reached",
                    request_id = %request_id,
                    row_cap,
                    "row cap reached; stopping sweep"
                );
                self.runtime
                    .log_request(
                        request_id,
                        LogLevel::Warn,
                        &format!("row cap of {row_cap} reached; remaining pages and datasets were skipped"),
                        Some(json!({ "rowCap": row_cap, "dataset": dataset.key })),
                    )
                    .await;
                break;
            }
        }

        info!(
            event_name = "worker.data_fetch.completed",
            request_id = %request_id,
            rows = fetched_total,
            capped,
            "dataset sweep completed"
        );
        self.runtime
            .log_request(
                request_id,
                LogLevel::Info,
                &format!("fetched {fetched_total} rows"),
                Some(json!({ "rows": fetched_total, "capped": capped })),
            )
            .await;
        Ok(())
    }

    async fn bulk(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError> {
        self.runtime
            .log_request(request_id, LogLevel::Info, "running bulk analysis in sandbox", None)
            .await;
        let input = json!({ "requestId": request_id, "payload": payload });
        let stdout = self.sandbox.execute(request_id, &input).await?;
        let outcome = parse_output(&stdout)?;

        let count = outcome.rows.len();
        for row in outcome.rows {
            let result = RequestResult::new(request_id.clone(), row.entity, row.row)
                .with_source(row.source.unwrap_or_else(|| "sandbox".to_string()))
                .with_canonical_key(row.canonical_key);
            self.runtime.journal().record_result(result).await?;
        }

        let stats = json!({ "rows": count, "sandbox": outcome.stats });
        self.runtime.progress(request_id, SWEEP_PROGRESS_CEILING, Some(stats)).await;
        self.runtime
            .log_request(request_id, LogLevel::Info, &format!("bulk analysis produced {count} rows"), None)
            .await;
        Ok(())
    }
}

#[async_trait]
impl Worker for DataFetchWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::DataFetch
    }

    async fn run(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError> {
        if self.runtime.has_completed(request_id).await? {
            self.runtime
                .log_request(request_id, LogLevel::Info, "data fetch already completed; skipping", None)
                .await;
            return Ok(());
        }

        match payload.validate()? {
            JobMode::BulkAnalysis => self.bulk(request_id, payload).await?,
            _ => self.sweep(request_id, payload).await?,
        }
        self.runtime.mark_completed(request_id).await
    }
}

/// Lists the datasets the fetch worker can sweep.
struct ListDatasetsTool;

#[async_trait]
impl Tool for ListDatasetsTool {
    fn name(&self) -> &str {
        "list_datasets"
    }

    fn description(&self) -> &str {
        "List the open-data datasets available for permit and complaint pulls."
    }

    fn parameter_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let datasets: Vec<Value> = CATALOG
            .iter()
            .map(|spec| json!({"key": spec.key, "sodaId": spec.soda_id, "entity": spec.entity}))
            .collect();
        Ok(json!({ "datasets": datasets }))
    }
}

pub struct DataFetchFactory {
    pub deps: AgentDeps,
    pub source: Arc<dyn DatasetSource>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub settings: FetchSettings,
}

impl WorkerFactory for DataFetchFactory {
    fn create(&self, id: &ActorId) -> Result<Box<dyn Worker>, AgentError> {
        let mut tools = ToolRegistry::default();
        tools.register(Arc::new(ListDatasetsTool));
        let runtime = AgentRuntime::new(id.clone(), self.deps.clone(), tools);
        Ok(Box::new(DataFetchWorker::new(
            runtime,
            Arc::clone(&self.source),
            Arc::clone(&self.sandbox),
            self.settings.clone(),
        )))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use dbi_core::domain::payload::{JobPayload, LocationFilter};
    use dbi_core::domain::request::{LogLevel, Request, RequestId};

    use super::testing::{idle_sandbox, EndlessSource, FlakySource, PagedSource, ScriptedSandbox};
    use super::{DataFetchWorker, FetchSettings};
    use crate::actor::{ActorId, Worker};
    use crate::errors::AgentError;
    use crate::runtime::testing::{deps, ScriptedProvider};
    use crate::runtime::{AgentDeps, AgentRuntime};
    use crate::tools::ToolRegistry;
    use crate::workers::sandbox::SandboxExecutor;
    use crate::workers::soda::DatasetSource;

    fn settings() -> FetchSettings {
        FetchSettings { page_size: 100, retry_base_delay: Duration::ZERO, ..FetchSettings::default() }
    }

    async fn worker(
        deps: &AgentDeps,
        id: &RequestId,
        source: Arc<dyn DatasetSource>,
        sandbox: Arc<dyn SandboxExecutor>,
        settings: FetchSettings,
    ) -> DataFetchWorker {
        deps.journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create");
        let runtime = AgentRuntime::new(ActorId::new("data_fetch", id.as_str()), deps.clone(), ToolRegistry::default());
        DataFetchWorker::new(runtime, source, sandbox, settings)
    }

    fn building_payload() -> JobPayload {
        JobPayload {
            permit_types: Some(vec!["building".to_string()]),
            location: Some(LocationFilter { block: Some("0123".to_string()), ..LocationFilter::default() }),
            ..JobPayload::default()
        }
    }

    #[tokio::test]
    async fn pages_until_a_short_page() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("fetch-1".to_string());
        let source = Arc::new(PagedSource::new(&[100, 100, 40]));
        let mut worker = worker(&deps, &id, source.clone(), Arc::new(idle_sandbox()), settings()).await;

        worker.run(&id, &building_payload()).await.expect("sweep");

        assert_eq!(deps.journal.result_count(&id).await.expect("count"), 240);
        let offsets: Vec<u64> = source.queries.lock().expect("queries").iter().map(|query| query.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);

        let queries = source.queries.lock().expect("queries").clone();
        assert_eq!(queries[0].where_clause.as_deref(), Some("block = '0123'"));
        assert_eq!(queries[0].order.as_deref(), Some("permit_number"));

        let results = deps.journal.results(&id).await.expect("results");
        assert_eq!(results[0].entity, "permit_building");
        assert_eq!(results[0].source.as_deref(), Some("i98e-djp9"));
        assert_eq!(results[0].canonical_key.as_deref(), Some("P0"));

        let meta = deps.journal.repository().find_meta(&id).await.expect("meta").expect("present");
        assert!((meta.progress - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unlimited_source_stops_at_row_cap_with_warning() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("fetch-cap".to_string());
        let source = Arc::new(EndlessSource { calls: AtomicUsize::new(0) });
        let settings = FetchSettings { page_size: 1000, ..settings() };
        let mut worker = worker(&deps, &id, source.clone(), Arc::new(idle_sandbox()), settings).await;

        worker.run(&id, &JobPayload::default()).await.expect("capped sweep is not an error");

        assert_eq!(deps.journal.result_count(&id).await.expect("count"), 20_000);
        assert_eq!(source.calls.load(Ordering::SeqCst), 20);

        let logs = deps.journal.repository().list_logs(&id).await.expect("logs");
        assert_eq!(logs.iter().filter(|log| log.level == LogLevel::Warn).count(), 1);
        assert!(logs.iter().all(|log| log.level != LogLevel::Error));
    }

    #[tokio::test]
    async fn a_failed_page_is_retried_once() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("fetch-retry".to_string());
        let source = Arc::new(FlakySource { failures: AtomicUsize::new(1), calls: AtomicUsize::new(0) });
        let mut worker = worker(&deps, &id, source.clone(), Arc::new(idle_sandbox()), settings()).await;

        worker.run(&id, &building_payload()).await.expect("recovers after one retry");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(deps.journal.result_count(&id).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn persistent_failures_surface_the_dataset_error() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("fetch-fail".to_string());
        let source = Arc::new(FlakySource { failures: AtomicUsize::new(5), calls: AtomicUsize::new(0) });
        let mut worker = worker(&deps, &id, source.clone(), Arc::new(idle_sandbox()), settings()).await;

        let error = worker.run(&id, &building_payload()).await.expect_err("fails");
        assert!(matches!(error, AgentError::Dataset(_)));
        assert_eq!(error.to_string(), "dataset `building` returned status 503: upstream unavailable");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn re_entry_does_not_duplicate_rows() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("fetch-twice".to_string());
        let source = Arc::new(PagedSource::new(&[10, 10]));
        let mut worker = worker(&deps, &id, source, Arc::new(idle_sandbox()), settings()).await;

        worker.run(&id, &building_payload()).await.expect("first");
        worker.run(&id, &building_payload()).await.expect("second");
        assert_eq!(deps.journal.result_count(&id).await.expect("count"), 10);
    }

    #[tokio::test]
    async fn bulk_mode_persists_sandbox_rows() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("bulk-ok".to_string());
        let stdout = json!({
            "requestId": "bulk-ok",
            "rows": [
                {"entity": "permit_building", "canonical_key": "P1", "row": {"permit_number": "P1"}, "source": "building"},
                {"entity": "insight", "canonical_key": null, "row": {"title": "spike"}, "source": "insights"}
            ],
            "stats": {"modules": ["building"]}
        })
        .to_string();
        let sandbox = Arc::new(ScriptedSandbox { result: Ok(stdout), inputs: Mutex::new(Vec::new()) });
        let mut worker = worker(&deps, &id, Arc::new(PagedSource::new(&[])), sandbox.clone(), settings()).await;

        let payload = JobPayload { mode: "bulk".to_string(), ..JobPayload::default() };
        worker.run(&id, &payload).await.expect("bulk");

        let results = deps.journal.results(&id).await.expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].source.as_deref(), Some("insights"));
        assert_eq!(sandbox.inputs.lock().expect("inputs")[0]["requestId"], "bulk-ok");
    }

    #[tokio::test]
    async fn bulk_failure_carries_stderr() {
        let deps = deps(Arc::new(ScriptedProvider::default()));
        let id = RequestId("bulk-fail".to_string());
        let sandbox = Arc::new(ScriptedSandbox {
            result: Err((Some(1), "KeyError: 'permit_number'".to_string())),
            inputs: Mutex::new(Vec::new()),
        });
        let mut worker = worker(&deps, &id, Arc::new(PagedSource::new(&[])), sandbox, settings()).await;

        let payload = JobPayload { mode: "bulk_analysis".to_string(), ..JobPayload::default() };
        let error = worker.run(&id, &payload).await.expect_err("fails");
        assert!(error.to_string().contains("KeyError: 'permit_number'"));
        assert_eq!(deps.journal.result_count(&id).await.expect("count"), 0);
    }
}
