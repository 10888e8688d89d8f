use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::{LogLevel, RequestId, RequestStatus};

/// Lifecycle events pushed to observers, one JSON object per frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    Log {
        request_id: RequestId,
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        request_id: RequestId,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<Value>,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        request_id: RequestId,
        status: RequestStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
        ts: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Log { request_id, .. }
            | Self::Progress { request_id, .. }
            | Self::Status { request_id, .. } => request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Progress { .. } => "progress",
            Self::Status { .. } => "status",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind()))
    }
}
