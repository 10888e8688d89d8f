//! External script execution for bulk analysis.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use dbi_core::config::SandboxConfig;
use dbi_core::domain::request::RequestId;

use crate::errors::SandboxError;

pub const INPUT_FILE: &str = "input.json";
const OPAQUE_ENTITY: &str = "bulk_result";

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Runs the analysis script over `input` and returns its captured stdout.
    async fn execute(&self, request_id: &RequestId, input: &Value) -> Result<String, SandboxError>;
}

/// Runs `program script <workspace>/<request id>/input.json` as a child process.
pub struct ProcessSandbox {
    program: String,
    script: PathBuf,
    workspace_dir: PathBuf,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(program: impl Into<String>, script: PathBuf, workspace_dir: PathBuf, timeout: Duration) -> Self {
        Self { program: program.into(), script, workspace_dir, timeout }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.script.clone(),
            config.workspace_dir.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn input_path(&self, request_id: &RequestId) -> PathBuf {
        self.workspace_dir.join(request_id.as_str()).join(INPUT_FILE)
    }
}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    async fn execute(&self, request_id: &RequestId, input: &Value) -> Result<String, SandboxError> {
        let input_path = self.input_path(request_id);
        if let Some(parent) = input_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(input).map_err(|error| SandboxError::InvalidOutput(error.to_string()))?;
        tokio::fs::write(&input_path, body).await?;

        debug!(
            event_name = "sandbox.execute.started",
            request_id = %request_id,
            program = %self.program,
            script = %self.script.display(),
            "starting sandbox script"
        );
        let child = Command::new(&self.program)
            .arg(&self.script)
            .arg(&input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                event_name = "sandbox.execute.failed",
                request_id = %request_id,
                code = output.status.code(),
                "sandbox script exited unsuccessfully"
            );
            return Err(SandboxError::NonZeroExit { code: output.status.code(), stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxRow {
    pub entity: String,
    pub canonical_key: Option<String>,
    pub source: Option<String>,
    pub row: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxOutcome {
    pub rows: Vec<SandboxRow>,
    pub stats: Option<Value>,
}

/// Accepts `{"rows": [...], "stats": ...}`, a bare array of rows, or any other value
/// as one opaque row. Leading log lines before the JSON document are tolerated.
pub fn parse_output(stdout: &str) -> Result<SandboxOutcome, SandboxError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::InvalidOutput("script produced no output".to_string()));
    }
    let document: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(error) => trimmed
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
            .ok_or_else(|| SandboxError::InvalidOutput(error.to_string()))?,
    };

    Ok(match document {
        Value::Object(mut object) if matches!(object.get("rows"), Some(Value::Array(_))) => {
            let rows = match object.remove("rows") {
                Some(Value::Array(rows)) => rows,
                _ => Vec::new(),
            };
            SandboxOutcome { rows: rows.into_iter().map(to_row).collect(), stats: object.remove("stats") }
        }
        Value::Array(rows) => SandboxOutcome { rows: rows.into_iter().map(to_row).collect(), stats: None },
        other => SandboxOutcome {
            rows: vec![SandboxRow { entity: OPAQUE_ENTITY.to_string(), canonical_key: None, source: None, row: other }],
            stats: None,
        },
    })
}

fn to_row(item: Value) -> SandboxRow {
    let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
    match item {
        Value::Object(mut object) if object.contains_key("row") && object.contains_key("entity") => SandboxRow {
            entity: text(object.get("entity")).unwrap_or_else(|| OPAQUE_ENTITY.to_string()),
            canonical_key: text(object.get("canonical_key")),
            source: text(object.get("source")),
            row: object.remove("row").unwrap_or(Value::Null),
        },
        other => SandboxRow { entity: OPAQUE_ENTITY.to_string(), canonical_key: None, source: None, row: other },
    }
}
