use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use dbi_core::domain::request::{
    Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
};

pub mod actor_state;
pub mod memory;
pub mod request;

pub use actor_state::SqlActorStateRepository;
pub use memory::{InMemoryActorStateRepository, InMemoryRequestRepository};
pub use request::SqlRequestRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Request, meta, log and result records. Logs and results are append-only.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Returns `false` when a request with the same id already exists.
    async fn create(&self, request: Request) -> Result<bool, RepositoryError>;

    async fn find(&self, id: &RequestId) -> Result<Option<Request>, RepositoryError>;

    async fn update_status(
        &self,
        id: &RequestId,
        status: RequestStatus,
        error_text: Option<&str>,
    ) -> Result<(), RepositoryError>;

    async fn find_meta(&self, id: &RequestId) -> Result<Option<RequestMeta>, RepositoryError>;

    async fn upsert_meta(&self, meta: RequestMeta) -> Result<(), RepositoryError>;

    async fn append_log(&self, log: RequestLog) -> Result<(), RepositoryError>;

    async fn list_logs(&self, id: &RequestId) -> Result<Vec<RequestLog>, RepositoryError>;

    async fn append_result(&self, result: RequestResult) -> Result<(), RepositoryError>;

    async fn list_results(&self, id: &RequestId) -> Result<Vec<RequestResult>, RepositoryError>;

    async fn count_results(&self, id: &RequestId) -> Result<u64, RepositoryError>;
}

/// Durable per-actor state, keyed by `(namespace, key)`.
#[async_trait]
pub trait ActorStateRepository: Send + Sync {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, RepositoryError>;

    async fn save(&self, namespace: &str, key: &str, state: Value) -> Result<(), RepositoryError>;
}
