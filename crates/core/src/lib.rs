pub mod config;
pub mod datasets;
pub mod domain;
pub mod errors;
pub mod query;

pub use config::{AppConfig, ConfigError, LoadOptions, ProviderKind};
pub use datasets::DatasetSpec;
pub use domain::event::LifecycleEvent;
pub use domain::payload::{JobMode, JobPayload, WorkerKind};
pub use domain::request::{
    LogLevel, Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
