use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use dbi_core::domain::request::{
    Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
};

use super::{ActorStateRepository, RepositoryError, RequestRepository};

#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<HashMap<String, Request>>,
    metas: RwLock<HashMap<String, RequestMeta>>,
    logs: RwLock<Vec<RequestLog>>,
    results: RwLock<Vec<RequestResult>>,
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn create(&self, request: Request) -> Result<bool, RepositoryError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(request.id.as_str()) {
            return Ok(false);
        }
        self.metas
            .write()
            .await
            .insert(request.id.0.clone(), RequestMeta::new(request.id.clone()));
        requests.insert(request.id.0.clone(), request);
        Ok(true)
    }

    async fn find(&self, id: &RequestId) -> Result<Option<Request>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(id.as_str()).cloned())
    }

    async fn update_status(
        &self,
        id: &RequestId,
        status: RequestStatus,
        error_text: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id.as_str())
            .ok_or_else(|| RepositoryError::NotFound(format!("request `{id}`")))?;
        request.status = status;
        request.error_text = error_text.map(str::to_string);
        Ok(())
    }

    async fn find_meta(&self, id: &RequestId) -> Result<Option<RequestMeta>, RepositoryError> {
        let metas = self.metas.read().await;
        Ok(metas.get(id.as_str()).cloned())
    }

    async fn upsert_meta(&self, meta: RequestMeta) -> Result<(), RepositoryError> {
        let mut metas = self.metas.write().await;
        let entry = metas
            .entry(meta.request_id.0.clone())
            .or_insert_with(|| RequestMeta::new(meta.request_id.clone()));
        entry.progress = entry.progress.max(meta.progress);
        entry.stats = meta.stats;
        Ok(())
    }

    async fn append_log(&self, log: RequestLog) -> Result<(), RepositoryError> {
        self.logs.write().await.push(log);
        Ok(())
    }

    async fn list_logs(&self, id: &RequestId) -> Result<Vec<RequestLog>, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().filter(|log| &log.request_id == id).cloned().collect())
    }

    async fn append_result(&self, result: RequestResult) -> Result<(), RepositoryError> {
        self.results.write().await.push(result);
        Ok(())
    }

    async fn list_results(&self, id: &RequestId) -> Result<Vec<RequestResult>, RepositoryError> {
        let results = self.results.read().await;
        Ok(results.iter().filter(|result| &result.request_id == id).cloned().collect())
    }

    async fn count_results(&self, id: &RequestId) -> Result<u64, RepositoryError> {
        let results = self.results.read().await;
        Ok(results.iter().filter(|result| &result.request_id == id).count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryActorStateRepository {
    states: RwLock<HashMap<(String, String), Value>>,
}

#[async_trait::async_trait]
impl ActorStateRepository for InMemoryActorStateRepository {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, RepositoryError> {
        let states = self.states.read().await;
        Ok(states.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn save(&self, namespace: &str, key: &str, state: Value) -> Result<(), RepositoryError> {
        let mut states = self.states.write().await;
        states.insert((namespace.to_string(), key.to_string()), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use dbi_core::domain::request::{Request, RequestId, RequestMeta, RequestStatus};

    use crate::repositories::{
        ActorStateRepository, InMemoryActorStateRepository, InMemoryRequestRepository,
        RequestRepository,
    };

    #[tokio::test]
    async fn in_memory_request_repo_round_trip() {
        let repo = InMemoryRequestRepository::default();
        let request = Request::queued(RequestId("req-mem-1".to_string()), "analyst");

        assert!(repo.create(request.clone()).await.expect("create"));
        assert!(!repo.create(request.clone()).await.expect("duplicate create"));

        repo.update_status(&request.id, RequestStatus::Running, None).await.expect("status");
        let found = repo.find(&request.id).await.expect("find").expect("request");
        assert_eq!(found.status, RequestStatus::Running);

        let mut meta = RequestMeta::new(request.id.clone());
        meta.progress = 0.5;
        repo.upsert_meta(meta.clone()).await.expect("upsert");
        meta.progress = 0.1;
        repo.upsert_meta(meta).await.expect("upsert lower");
        let stored = repo.find_meta(&request.id).await.expect("meta").expect("meta row");
        assert_eq!(stored.progress, 0.5);
    }

    #[tokio::test]
    async fn in_memory_actor_state_round_trip() {
        let repo = InMemoryActorStateRepository::default();
        repo.save("insights", "req-1", json!({"n": 1})).await.expect("save");

        assert_eq!(repo.load("insights", "req-1").await.expect("load"), Some(json!({"n": 1})));
        assert_eq!(repo.load("insights", "req-2").await.expect("load"), None);
    }
}
