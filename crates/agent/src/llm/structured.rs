//! Two-phase structured generation for backends without schema-constrained decoding.
//!
//! Phase one asks the reasoning path for a free-form analysis; phase two turns that
//! analysis into JSON conforming to the schema. An empty analysis stops the pipeline.

use async_trait::async_trait;
use serde_json::Value;

use super::{sanitize, Effort, StructuredOptions};
use crate::errors::AdapterError;

const ANALYSIS_INSTRUCTION: &str =
    "Analyze the request comprehensively. Do not answer in JSON; write a thorough prose analysis.";
const DEFAULT_STRUCTURING_INSTRUCTION: &str =
    "Convert the analysis below into a single JSON value that conforms exactly to the schema. \
     Respond with JSON only.";

/// The two calls a backend must offer to take part in the pipeline.
#[async_trait]
pub trait JsonStructurer: Send + Sync {
    async fn reason(&self, prompt: &str, effort: Effort) -> Result<String, AdapterError>;

    async fn structure(
        &self,
        analysis: &str,
        schema: &Value,
        instruction: &str,
    ) -> Result<Value, AdapterError>;
}

pub async fn two_phase(
    backend: &dyn JsonStructurer,
    prompt: &str,
    schema: &Value,
    options: &StructuredOptions,
) -> Result<Value, AdapterError> {
    let reasoning_prompt = format!("{ANALYSIS_INSTRUCTION}\n\n{prompt}");
    let effort = options.reasoning_effort.unwrap_or_default();
    let analysis = sanitize(&backend.reason(&reasoning_prompt, effort).await?);
    if analysis.trim().is_empty() {
        return Err(AdapterError::EmptyAnalysis);
    }

    let instruction = options
        .structuring_instruction
        .as_deref()
        .unwrap_or(DEFAULT_STRUCTURING_INSTRUCTION);
    let value = backend.structure(&analysis, schema, instruction).await?;
    validate_against_schema(schema, &value)?;
    Ok(value)
}

/// Parses model text as JSON after stripping reasoning blocks and fences.
pub fn parse_json_output(provider: &'static str, raw: &str) -> Result<Value, AdapterError> {
    let cleaned = sanitize(raw);
    serde_json::from_str(&cleaned).map_err(|error| AdapterError::InvalidResponse {
        provider,
        message: format!("expected json output: {error}"),
    })
}

pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), AdapterError> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|error| AdapterError::SchemaMismatch(format!("invalid schema: {error}")))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(value).map(|error| error.to_string()).collect();
    Err(AdapterError::SchemaMismatch(errors.join("; ")))
}
