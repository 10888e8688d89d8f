use thiserror::Error;

use dbi_core::errors::DomainError;
use dbi_db::RepositoryError;

use crate::llm::ProviderKind;

/// Failures from a provider backend. Never retried by the adapter itself.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{provider} request failed: {message}")]
    Request { provider: &'static str, message: String },
    #[error("{provider} returned status {status}: {message}")]
    Status { provider: &'static str, status: u16, message: String },
    #[error("{provider} returned an invalid response: {message}")]
    InvalidResponse { provider: &'static str, message: String },
    #[error("reasoning phase produced an empty analysis; refusing to structure it")]
    EmptyAnalysis,
    #[error("{provider} cannot accept a {tag} image")]
    UnsupportedImage { provider: &'static str, tag: &'static str },
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("provider `{}` is not configured", .0.as_str())]
    Unavailable(ProviderKind),
    #[error("structured output does not match the schema: {0}")]
    SchemaMismatch(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool `{tool}` failed: {message}")]
    Execution { tool: String, message: String },
    #[error("unknown tool `{0}`")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox script exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("sandbox output is not valid json: {0}")]
    InvalidOutput(String),
    #[error("sandbox script timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset request failed: {0}")]
    Http(String),
    #[error("dataset `{dataset}` returned status {status}: {body}")]
    Status { dataset: String, status: u16, body: String },
    #[error("dataset `{dataset}` returned an unexpected body: {message}")]
    Decode { dataset: String, message: String },
}

/// Umbrella error for actor operations; the display text becomes a request's `errorText`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] RepositoryError),
    #[error("{0}")]
    Invariant(String),
}
