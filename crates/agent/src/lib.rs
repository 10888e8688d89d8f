//! Agent runtime for the permit intelligence service.
//!
//! The crate wires model providers, tools and durable actor state into workers,
//! and drives each request through its lifecycle:
//!
//! 1. **Orchestration** (`orchestrator`) - accept, classify and route a request
//! 2. **Workers** (`workers`) - fetch datasets, answer questions, derive insights
//! 3. **Runtime** (`runtime`) - provider calls, tool registry and per-actor state
//! 4. **Journal** (`journal`) - logs, progress and status fanned out to observers
//!
//! Model output never decides a request's status. Workers report success or failure
//! and the orchestrator records the transition.

pub mod actor;
pub mod errors;
pub mod journal;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod runtime;
pub mod tools;
pub mod workers;

pub use actor::{ActorDirectory, ActorId, Worker, WorkerFactory};
pub use errors::{AdapterError, AgentError, DatasetError, SandboxError, ToolError};
pub use journal::{EventHub, RequestJournal};
pub use orchestrator::{IntentClassifier, LlmIntentClassifier, Orchestrator, StartAck};
pub use runtime::{AgentDeps, AgentRuntime};
