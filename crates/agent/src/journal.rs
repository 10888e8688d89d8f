//! Lifecycle writes for requests and the broadcast hub that mirrors them to observers.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use dbi_core::domain::event::LifecycleEvent;
use dbi_core::domain::request::{
    LogLevel, Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
};
use dbi_db::{RepositoryError, RequestRepository};

use crate::errors::AgentError;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out of lifecycle events. Slow receivers lag and drop events on their own.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of observers reached; zero observers is not an error.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Sole writer of request, meta, log and result records.
#[derive(Clone)]
pub struct RequestJournal {
    repository: Arc<dyn RequestRepository>,
    hub: EventHub,
}

impl RequestJournal {
    pub fn new(repository: Arc<dyn RequestRepository>, hub: EventHub) -> Self {
        Self { repository, hub }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn repository(&self) -> &Arc<dyn RequestRepository> {
        &self.repository
    }

    /// Returns `false` when the id is already taken.
    pub async fn create(&self, request: Request) -> Result<bool, AgentError> {
        let request_id = request.id.clone();
        let created = self.repository.create(request).await?;
        if created {
            self.hub.publish(LifecycleEvent::Status {
                request_id,
                status: RequestStatus::Queued,
                error_text: None,
                ts: Utc::now(),
            });
        }
        Ok(created)
    }

    pub async fn find(&self, request_id: &RequestId) -> Result<Option<Request>, AgentError> {
        Ok(self.repository.find(request_id).await?)
    }

    pub async fn log(&self, request_id: &RequestId, level: LogLevel, message: &str, data: Option<Value>) {
        let entry = RequestLog {
            request_id: request_id.clone(),
            level,
            message: message.to_string(),
            data: data.clone(),
            created_at: Utc::now(),
        };
        guarded("log", request_id, self.repository.append_log(entry)).await;

        self.hub.publish(LifecycleEvent::Log {
            request_id: request_id.clone(),
            level,
            message: message.to_string(),
            data,
            ts: Utc::now(),
        });
    }

    pub async fn progress(&self, request_id: &RequestId, fraction: f64, stats: Option<Value>) {
        let current = match self.repository.find_meta(request_id).await {
            Ok(meta) => meta,
            Err(error) => {
                report_failure("progress", request_id, &error);
                None
            }
        };
        let mut meta = current.unwrap_or_else(|| RequestMeta::new(request_id.clone()));
        meta.advance(fraction, stats);
        let progress = meta.progress;
        let stats = (!meta.stats.is_null()).then(|| meta.stats.clone());
        guarded("progress", request_id, self.repository.upsert_meta(meta)).await;

        self.hub.publish(LifecycleEvent::Progress {
            request_id: request_id.clone(),
            progress,
            stats,
            ts: Utc::now(),
        });
    }

    /// Applies a status transition; illegal transitions are rejected.
    pub async fn status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        error_text: Option<String>,
    ) -> Result<(), AgentError> {
        let mut request = self
            .repository
            .find(request_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("request `{request_id}`")))?;
        request.transition_to(status, error_text)?;
        self.repository
            .update_status(request_id, request.status, request.error_text.as_deref())
            .await?;

        debug!(
            event_name = "journal.status.changed",
            request_id = %request_id,
            status = status.as_str(),
            "request status changed"
        );
        self.hub.publish(LifecycleEvent::Status {
            request_id: request_id.clone(),
            status: request.status,
            error_text: request.error_text,
            ts: Utc::now(),
        });
        Ok(())
    }

    pub async fn record_result(&self, result: RequestResult) -> Result<(), AgentError> {
        Ok(self.repository.append_result(result).await?)
    }

    pub async fn results(&self, request_id: &RequestId) -> Result<Vec<RequestResult>, AgentError> {
        Ok(self.repository.list_results(request_id).await?)
    }

    pub async fn result_count(&self, request_id: &RequestId) -> Result<u64, AgentError> {
        Ok(self.repository.count_results(request_id).await?)
    }
}

/// The one place where durable lifecycle writes are allowed to fail silently.
async fn guarded<F>(operation: &'static str, request_id: &RequestId, write: F)
where
    F: Future<Output = Result<(), RepositoryError>>,
{
    if let Err(error) = write.await {
        report_failure(operation, request_id, &error);
    }
}

fn report_failure(operation: &'static str, request_id: &RequestId, error: &RepositoryError) {
    warn!(
        event_name = "journal.write.failed",
        request_id = %request_id,
        operation,
        error = %error,
        "lifecycle write failed; continuing"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use dbi_core::domain::event::LifecycleEvent;
    use dbi_core::domain::request::{
        LogLevel, Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
    };
    use dbi_db::{InMemoryRequestRepository, RepositoryError, RequestRepository};

    use super::{EventHub, RequestJournal};
    use crate::errors::AgentError;

    fn journal() -> RequestJournal {
        RequestJournal::new(Arc::new(InMemoryRequestRepository::default()), EventHub::default())
    }

    #[tokio::test]
    async fn status_rejects_illegal_transitions() {
        let journal = journal();
        let id = RequestId("j-1".to_string());
        assert!(journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create"));

        let skipped = journal.status(&id, RequestStatus::Complete, None).await;
        assert!(matches!(skipped, Err(AgentError::Validation(_))));

        journal.status(&id, RequestStatus::Running, None).await.expect("running");
        journal.status(&id, RequestStatus::Error, Some("boom".to_string())).await.expect("error");

        let stored = journal.find(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::Error);
        assert_eq!(stored.error_text.as_deref(), Some("boom"));
        assert!(journal.status(&id, RequestStatus::Running, None).await.is_err());
    }

    #[tokio::test]
    async fn progress_events_never_go_backwards() {
        let journal = journal();
        let id = RequestId("j-2".to_string());
        journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create");
        let mut events = journal.hub().subscribe();

        for fraction in [0.2, 0.5, 0.3, 0.9] {
            journal.progress(&id, fraction, Some(json!({"step": fraction}))).await;
        }

        let mut seen = Vec::new();
        while let Ok(LifecycleEvent::Progress { progress, .. }) = events.try_recv() {
            seen.push(progress);
        }
        assert_eq!(seen, vec![0.2, 0.5, 0.5, 0.9]);
    }

    #[test]
    fn publishing_without_observers_is_fine() {
        let hub = EventHub::new(4);
        let delivered = hub.publish(LifecycleEvent::Status {
            request_id: RequestId("nobody".to_string()),
            status: RequestStatus::Queued,
            error_text: None,
            ts: chrono::Utc::now(),
        });
        assert_eq!(delivered, 0);
    }

    struct BrokenLogs {
        inner: InMemoryRequestRepository,
    }

    #[async_trait]
    impl RequestRepository for BrokenLogs {
        async fn create(&self, request: Request) -> Result<bool, RepositoryError> {
            self.inner.create(request).await
        }

        async fn find(&self, id: &RequestId) -> Result<Option<Request>, RepositoryError> {
            self.inner.find(id).await
        }

        async fn update_status(
            &self,
            id: &RequestId,
            status: RequestStatus,
            error_text: Option<&str>,
        ) -> Result<(), RepositoryError> {
            self.inner.update_status(id, status, error_text).await
        }

        async fn find_meta(&self, _id: &RequestId) -> Result<Option<RequestMeta>, RepositoryError> {
            Err(RepositoryError::Decode("meta table offline".to_string()))
        }

        async fn upsert_meta(&self, _meta: RequestMeta) -> Result<(), RepositoryError> {
            Err(RepositoryError::Decode("meta table offline".to_string()))
        }

        async fn append_log(&self, _log: RequestLog) -> Result<(), RepositoryError> {
            Err(RepositoryError::Decode("log table offline".to_string()))
        }

        async fn list_logs(&self, id: &RequestId) -> Result<Vec<RequestLog>, RepositoryError> {
            self.inner.list_logs(id).await
        }

        async fn append_result(&self, result: RequestResult) -> Result<(), RepositoryError> {
            self.inner.append_result(result).await
        }

        async fn list_results(&self, id: &RequestId) -> Result<Vec<RequestResult>, RepositoryError> {
            self.inner.list_results(id).await
        }

        async fn count_results(&self, id: &RequestId) -> Result<u64, RepositoryError> {
            self.inner.count_results(id).await
        }
    }

    #[tokio::test]
    async fn failed_log_writes_do_not_propagate() {
        let repository = Arc::new(BrokenLogs { inner: InMemoryRequestRepository::default() });
        let journal = RequestJournal::new(repository, EventHub::default());
        let id = RequestId("j-3".to_string());
        journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create");
        let mut events = journal.hub().subscribe();

        journal.log(&id, LogLevel::Info, "still observable", None).await;
        journal.progress(&id, 0.4, None).await;

        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Log { .. })));
        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Progress { progress, .. }) if progress == 0.4));
        journal.status(&id, RequestStatus::Running, None).await.expect("status still enforced");
    }
}
