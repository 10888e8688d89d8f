use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DomainError;

const REQUEST_ID_MAX_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::InvalidPayload("request id must not be empty".to_string()));
        }
        if trimmed.len() > REQUEST_ID_MAX_LEN {
            return Err(DomainError::InvalidPayload(format!(
                "request id exceeds {REQUEST_ID_MAX_LEN} bytes"
            )));
        }
        let valid = trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !valid {
            return Err(DomainError::InvalidPayload(format!(
                "request id `{trimmed}` may only contain letters, digits, `-`, `_` or `.`"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [Self::Queued, Self::Running, Self::Complete, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// `Queued -> Error` is only taken when a payload fails validation before dispatch.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Error)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Error)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: String,
    pub status: RequestStatus,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn queued(id: RequestId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            status: RequestStatus::Queued,
            error_text: None,
            created_at: Utc::now(),
        }
    }

    pub fn transition_to(
        &mut self,
        next: RequestStatus,
        error_text: Option<String>,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidRequestTransition { from: self.status, to: next });
        }

        self.status = next;
        self.error_text = if next == RequestStatus::Error { error_text } else { None };
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub request_id: RequestId,
    pub progress: f64,
    pub stats: Value,
}

impl RequestMeta {
    pub fn new(request_id: RequestId) -> Self {
        Self { request_id, progress: 0.0, stats: Value::Null }
    }

    /// Progress only moves forward; a lower fraction is ignored while stats still apply.
    pub fn advance(&mut self, fraction: f64, stats: Option<Value>) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if fraction > self.progress {
            self.progress = fraction;
        }
        if let Some(stats) = stats {
            self.stats = stats;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: RequestId,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: RequestId,
    pub entity: String,
    pub source: Option<String>,
    pub canonical_key: Option<String>,
    pub row: Value,
    pub created_at: DateTime<Utc>,
}

impl RequestResult {
    pub fn new(request_id: RequestId, entity: impl Into<String>, row: Value) -> Self {
        Self {
            request_id,
            entity: entity.into(),
            source: None,
            canonical_key: None,
            row,
            created_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_canonical_key(mut self, canonical_key: Option<String>) -> Self {
        self.canonical_key = canonical_key;
        self
    }
}
