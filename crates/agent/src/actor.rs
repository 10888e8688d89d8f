//! Actor identities and the in-process directory that resolves them to worker instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use dbi_core::domain::payload::{JobPayload, WorkerKind};
use dbi_core::domain::request::RequestId;

use crate::errors::AgentError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    pub namespace: String,
    pub key: String,
}

impl ActorId {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), key: key.into() }
    }

    /// Same worker kind and request always yield the same identity.
    pub fn for_request(kind: WorkerKind, request_id: &RequestId) -> Self {
        Self::new(kind.as_str(), request_id.as_str())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// A routed actor. `run` must tolerate being called again for the same request.
#[async_trait]
pub trait Worker: Send {
    fn kind(&self) -> WorkerKind;

    async fn run(&mut self, request_id: &RequestId, payload: &JobPayload) -> Result<(), AgentError>;
}

pub trait WorkerFactory: Send + Sync {
    fn create(&self, id: &ActorId) -> Result<Box<dyn Worker>, AgentError>;
}

pub type WorkerHandle = Arc<Mutex<Box<dyn Worker>>>;

/// Resolves identities to live instances; calls into one instance are serialised.
#[derive(Default)]
pub struct ActorDirectory {
    factories: HashMap<WorkerKind, Arc<dyn WorkerFactory>>,
    instances: Mutex<HashMap<ActorId, WorkerHandle>>,
}

impl ActorDirectory {
    pub fn register(&mut self, kind: WorkerKind, factory: Arc<dyn WorkerFactory>) {
        self.factories.insert(kind, factory);
    }

    pub async fn resolve(&self, kind: WorkerKind, request_id: &RequestId) -> Result<WorkerHandle, AgentError> {
        let id = ActorId::for_request(kind, request_id);
        let mut instances = self.instances.lock().await;
        if let Some(handle) = instances.get(&id) {
            return Ok(Arc::clone(handle));
        }

        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| AgentError::Invariant(format!("no worker registered for `{}`", kind.as_str())))?;
        let handle: WorkerHandle = Arc::new(Mutex::new(factory.create(&id)?));
        debug!(event_name = "actor.directory.created", actor_id = %id, "actor instance created");
        instances.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Runs the worker addressed by `(kind, request_id)` and waits for it.
    pub async fn dispatch(
        &self,
        kind: WorkerKind,
        request_id: &RequestId,
        payload: &JobPayload,
    ) -> Result<(), AgentError> {
        let handle = self.resolve(kind, request_id).await?;
        let mut worker = handle.lock().await;
        worker.run(request_id, payload).await
    }

    /// Drops in-memory instances for a request; durable state is untouched.
    pub async fn release(&self, request_id: &RequestId) -> usize {
        let mut instances = self.instances.lock().await;
        let before = instances.len();
        instances.retain(|id, _| id.key != request_id.as_str());
        before - instances.len()
    }

    pub async fn live_instances(&self) -> usize {
        self.instances.lock().await.len()
    }
}
