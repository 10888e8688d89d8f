//! Worker actors the orchestrator routes requests to.

use std::sync::Arc;

use dbi_core::domain::payload::WorkerKind;

use crate::actor::ActorDirectory;
use crate::runtime::AgentDeps;

pub mod analyst;
pub mod dataset_fetch;
pub mod insights;
pub mod sandbox;
pub mod soda;

pub use analyst::{AnalystFactory, AnalystWorker};
pub use dataset_fetch::{DataFetchFactory, DataFetchWorker, FetchSettings};
pub use insights::{InsightsFactory, InsightsWorker};
pub use sandbox::{parse_output, ProcessSandbox, SandboxExecutor, SandboxOutcome, SandboxRow};
pub use soda::{DatasetSource, SodaClient};

/// Directory with the three standard workers registered.
pub fn standard_directory(
    deps: &AgentDeps,
    source: Arc<dyn DatasetSource>,
    sandbox: Arc<dyn SandboxExecutor>,
    settings: FetchSettings,
) -> ActorDirectory {
    let mut directory = ActorDirectory::default();
    directory.register(
        WorkerKind::DataFetch,
        Arc::new(DataFetchFactory { deps: deps.clone(), source, sandbox, settings }),
    );
    directory.register(WorkerKind::Insights, Arc::new(InsightsFactory { deps: deps.clone() }));
    directory.register(WorkerKind::Analyst, Arc::new(AnalystFactory { deps: deps.clone() }));
    directory
}
