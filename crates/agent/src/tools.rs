//! Tool registry and the tracing decorator around tool execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::ToolError;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the `args` object passed to [`Tool::execute`].
    fn parameter_schema(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Receives the three trace events of a tool invocation.
pub trait ToolTraceSink: Send + Sync {
    fn on_invoke(&self, tool: &str, args: &Value);
    fn on_success(&self, tool: &str, result: &str, elapsed: Duration);
    fn on_failure(&self, tool: &str, error: &str, elapsed: Duration);
}

/// Sink that writes trace events through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingToolSink {
    actor: String,
}

impl TracingToolSink {
    pub fn new(actor: impl Into<String>) -> Self {
        Self { actor: actor.into() }
    }
}

impl ToolTraceSink for TracingToolSink {
    fn on_invoke(&self, tool: &str, _args: &Value) {
        info!(event_name = "agent.tool.invoked", actor_id = %self.actor, tool, "invoking tool {tool}");
    }

    fn on_success(&self, tool: &str, result: &str, elapsed: Duration) {
        info!(
            event_name = "agent.tool.succeeded",
            actor_id = %self.actor,
            tool,
            elapsed_ms = elapsed.as_millis() as u64,
            result,
            "tool completed"
        );
    }

    fn on_failure(&self, tool: &str, error: &str, elapsed: Duration) {
        warn!(
            event_name = "agent.tool.failed",
            actor_id = %self.actor,
            tool,
            elapsed_ms = elapsed.as_millis() as u64,
            error,
            "tool failed"
        );
    }
}

pub fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::Validator::new(schema).map_err(|error| ToolError::Execution {
        tool: tool.to_string(),
        message: format!("tool declares an invalid schema: {error}"),
    })?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let message = validator.iter_errors(args).map(|error| error.to_string()).collect::<Vec<_>>().join("; ");
    Err(ToolError::InvalidArguments { tool: tool.to_string(), message })
}

/// Wraps a tool so each call emits exactly one success or failure event.
pub struct TracedTool {
    inner: Arc<dyn Tool>,
    sink: Arc<dyn ToolTraceSink>,
}

impl TracedTool {
    pub fn new(inner: Arc<dyn Tool>, sink: Arc<dyn ToolTraceSink>) -> Self {
        Self { inner, sink }
    }
}

#[async_trait]
impl Tool for TracedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameter_schema(&self) -> Value {
        self.inner.parameter_schema()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let name = self.inner.name();
        self.sink.on_invoke(name, &args);
        let started = Instant::now();

        let outcome = match validate_arguments(name, &self.inner.parameter_schema(), &args) {
            Ok(()) => self.inner.execute(args).await,
            Err(error) => Err(error),
        };

        match &outcome {
            Ok(result) => self.sink.on_success(name, &result.to_string(), started.elapsed()),
            Err(error) => self.sink.on_failure(name, &error.to_string(), started.elapsed()),
        }
        outcome
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Merges two tool sets; `custom` replaces `core` entries with the same name.
    pub fn union(core: &ToolRegistry, custom: &ToolRegistry) -> ToolRegistry {
        let mut merged = core.clone();
        for tool in custom.tools.values() {
            merged.register(Arc::clone(tool));
        }
        merged
    }

    /// Returns a copy whose tools all report through `sink`.
    pub fn traced(&self, sink: Arc<dyn ToolTraceSink>) -> ToolRegistry {
        let mut traced = ToolRegistry::default();
        for tool in self.tools.values() {
            traced.register(Arc::new(TracedTool::new(Arc::clone(tool), Arc::clone(&sink))));
        }
        traced
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tool.execute(args).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{Tool, ToolRegistry, ToolTraceSink, TracedTool};
    use crate::errors::ToolError;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl ToolTraceSink for RecordingSink {
        fn on_invoke(&self, tool: &str, _args: &Value) {
            self.events.lock().expect("events lock").push(format!("invoke:{tool}"));
        }

        fn on_success(&self, tool: &str, result: &str, _elapsed: Duration) {
            self.events.lock().expect("events lock").push(format!("success:{tool}:{result}"));
        }

        fn on_failure(&self, tool: &str, error: &str, _elapsed: Duration) {
            self.events.lock().expect("events lock").push(format!("failure:{tool}:{error}"));
        }
    }

    struct FixedTool {
        name: &'static str,
        description: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            self.description
        }

        fn parameter_schema(&self) -> Value {
            json!({"type": "object", "properties": {"n": {"type": "integer"}}, "required": ["n"]})
        }

        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            if self.fail {
                return Err(ToolError::Execution { tool: self.name.to_string(), message: "boom".to_string() });
            }
            Ok(json!({"echo": args["n"]}))
        }
    }

    fn tool(name: &'static str, description: &'static str, fail: bool) -> Arc<dyn Tool> {
        Arc::new(FixedTool { name, description, fail })
    }

    #[tokio::test]
    async fn failing_tool_emits_exactly_one_failure_event() {
        let sink = Arc::new(RecordingSink::default());
        let traced = TracedTool::new(tool("explode", "always fails", true), sink.clone());

        let error = traced.execute(json!({"n": 1})).await.expect_err("tool fails");
        assert_eq!(error.to_string(), "tool `explode` failed: boom");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "invoke:explode");
        assert_eq!(events.iter().filter(|event| event.starts_with("failure:")).count(), 1);
        assert_eq!(events.iter().filter(|event| event.starts_with("success:")).count(), 0);
    }

    #[tokio::test]
    async fn successful_tool_emits_stringified_result() {
        let sink = Arc::new(RecordingSink::default());
        let traced = TracedTool::new(tool("echo", "echoes", false), sink.clone());

        traced.execute(json!({"n": 7})).await.expect("tool succeeds");
        assert_eq!(sink.events(), vec!["invoke:echo".to_string(), "success:echo:{\"echo\":7}".to_string()]);
    }

    #[tokio::test]
    async fn invalid_arguments_are_traced_as_failures() {
        let sink = Arc::new(RecordingSink::default());
        let traced = TracedTool::new(tool("echo", "echoes", false), sink.clone());

        let error = traced.execute(json!({"n": "seven"})).await.expect_err("schema rejects");
        assert!(matches!(error, ToolError::InvalidArguments { .. }));
        assert!(sink.events()[1].starts_with("failure:echo:invalid arguments"));
    }

    #[tokio::test]
    async fn union_prefers_custom_tools_on_collision() {
        let mut core = ToolRegistry::default();
        core.register(tool("search_knowledge", "core search", false));
        core.register(tool("store_fact", "core store", false));

        let mut custom = ToolRegistry::default();
        custom.register(tool("search_knowledge", "custom search", false));
        custom.register(tool("fetch_permits", "custom fetch", false));

        let merged = ToolRegistry::union(&core, &custom);
        assert_eq!(merged.names(), vec!["fetch_permits", "search_knowledge", "store_fact"]);
        assert_eq!(merged.get("search_knowledge").expect("present").description(), "custom search");

        let unknown = merged.invoke("missing", json!({})).await.expect_err("unknown tool");
        assert!(matches!(unknown, ToolError::Unknown(name) if name == "missing"));
    }
}
