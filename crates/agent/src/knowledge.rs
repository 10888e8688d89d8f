//! Per-agent knowledge base and the core tools every agent exposes over it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use dbi_db::{ActorStateRepository, RepositoryError};

use crate::errors::ToolError;
use crate::tools::{Tool, ToolRegistry};

const KNOWLEDGE_NAMESPACE: &str = "knowledge";
const DEFAULT_LIMIT: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub content: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), subject: None, tags: Vec::new(), created_at: Utc::now() }
    }

    fn score(&self, terms: &[String]) -> usize {
        let haystack = format!(
            "{} {} {}",
            self.subject.as_deref().unwrap_or_default(),
            self.content,
            self.tags.join(" ")
        )
        .to_lowercase();
        terms.iter().filter(|term| haystack.contains(term.as_str())).count()
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn store(&self, fact: Fact) -> Result<(), RepositoryError>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, RepositoryError>;
    /// Most recent facts, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Fact>, RepositoryError>;
}

/// Ranks by number of matched query terms, newer facts first on ties.
fn rank(facts: &[Fact], query: &str, limit: usize) -> Vec<Fact> {
    let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &Fact)> = facts
        .iter()
        .map(|fact| (fact.score(&terms), fact))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|left, right| right.0.cmp(&left.0).then(right.1.created_at.cmp(&left.1.created_at)));
    scored.into_iter().take(limit).map(|(_, fact)| fact.clone()).collect()
}

fn most_recent(facts: &[Fact], limit: usize) -> Vec<Fact> {
    facts.iter().rev().take(limit).cloned().collect()
}

#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    facts: RwLock<Vec<Fact>>,
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn store(&self, fact: Fact) -> Result<(), RepositoryError> {
        self.facts.write().await.push(fact);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, RepositoryError> {
        Ok(rank(&self.facts.read().await, query, limit))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Fact>, RepositoryError> {
        Ok(most_recent(&self.facts.read().await, limit))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct KnowledgeState {
    #[serde(default)]
    facts: Vec<Fact>,
}

/// Knowledge persisted in the owning actor's durable state.
pub struct DurableKnowledgeStore {
    repository: Arc<dyn ActorStateRepository>,
    actor_key: String,
    write_lock: Mutex<()>,
}

impl DurableKnowledgeStore {
    pub fn new(repository: Arc<dyn ActorStateRepository>, actor_key: impl Into<String>) -> Self {
        Self { repository, actor_key: actor_key.into(), write_lock: Mutex::new(()) }
    }

    async fn load(&self) -> Result<KnowledgeState, RepositoryError> {
        match self.repository.load(KNOWLEDGE_NAMESPACE, &self.actor_key).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|error| RepositoryError::Decode(format!("knowledge state: {error}"))),
            None => Ok(KnowledgeState::default()),
        }
    }
}

#[async_trait]
impl KnowledgeStore for DurableKnowledgeStore {
    async fn store(&self, fact: Fact) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        state.facts.push(fact);
        let value = serde_json::to_value(&state)
            .map_err(|error| RepositoryError::Decode(format!("knowledge state: {error}")))?;
        self.repository.save(KNOWLEDGE_NAMESPACE, &self.actor_key, value).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Fact>, RepositoryError> {
        Ok(rank(&self.load().await?.facts, query, limit))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Fact>, RepositoryError> {
        Ok(most_recent(&self.load().await?.facts, limit))
    }
}

fn storage_failure(tool: &str, error: RepositoryError) -> ToolError {
    ToolError::Execution { tool: tool.to_string(), message: error.to_string() }
}

fn limit_arg(args: &Value) -> usize {
    args.get("limit").and_then(Value::as_u64).map_or(DEFAULT_LIMIT, |limit| limit as usize)
}

pub struct SearchKnowledgeTool {
    store: Arc<dyn KnowledgeStore>,
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search facts this agent has stored earlier."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1},
                "limit": {"type": "integer", "minimum": 1, "maximum": 50}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        let facts = self
            .store
            .search(query, limit_arg(&args))
            .await
            .map_err(|error| storage_failure(self.name(), error))?;
        Ok(json!({ "facts": facts }))
    }
}

pub struct StoreFactTool {
    store: Arc<dyn KnowledgeStore>,
}

#[async_trait]
impl Tool for StoreFactTool {
    fn name(&self) -> &str {
        "store_fact"
    }

    fn description(&self) -> &str {
        "Remember a fact for later requests handled by this agent."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "minLength": 1},
                "subject": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let mut fact = Fact::new(args.get("content").and_then(Value::as_str).unwrap_or_default());
        fact.subject = args.get("subject").and_then(Value::as_str).map(str::to_string);
        fact.tags = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        self.store.store(fact).await.map_err(|error| storage_failure(self.name(), error))?;
        Ok(json!({ "stored": true }))
    }
}

pub struct GetContextTool {
    store: Arc<dyn KnowledgeStore>,
}

#[async_trait]
impl Tool for GetContextTool {
    fn name(&self) -> &str {
        "get_context"
    }

    fn description(&self) -> &str {
        "Return the most recently stored facts."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"limit": {"type": "integer", "minimum": 1, "maximum": 50}}
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let facts = self
            .store
            .recent(limit_arg(&args))
            .await
            .map_err(|error| storage_failure(self.name(), error))?;
        Ok(json!({ "facts": facts }))
    }
}

/// The tool set shared by every agent.
pub fn core_tools(store: Arc<dyn KnowledgeStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(SearchKnowledgeTool { store: Arc::clone(&store) }));
    registry.register(Arc::new(StoreFactTool { store: Arc::clone(&store) }));
    registry.register(Arc::new(GetContextTool { store }));
    registry
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use dbi_db::InMemoryActorStateRepository;

    use super::{core_tools, DurableKnowledgeStore, Fact, InMemoryKnowledgeStore, KnowledgeStore};

    #[tokio::test]
    async fn search_ranks_by_matched_terms() {
        let store = InMemoryKnowledgeStore::default();
        store.store(Fact::new("Mission district permits spiked in March")).await.expect("store");
        store.store(Fact::new("Plumbing permits are slow to close")).await.expect("store");
        store.store(Fact::new("Unrelated note")).await.expect("store");

        let hits = store.search("mission permits", 5).await.expect("search");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.starts_with("Mission"));
        assert!(store.search("   ", 5).await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn durable_store_is_scoped_to_actor_key() {
        let repository = Arc::new(InMemoryActorStateRepository::default());
        let first = DurableKnowledgeStore::new(repository.clone(), "analyst:req-1");
        let second = DurableKnowledgeStore::new(repository.clone(), "analyst:req-2");

        first.store(Fact::new("block 0123 has open complaints")).await.expect("store");

        assert_eq!(first.recent(10).await.expect("recent").len(), 1);
        assert!(second.recent(10).await.expect("recent").is_empty());

        let reopened = DurableKnowledgeStore::new(repository, "analyst:req-1");
        assert_eq!(reopened.search("complaints", 5).await.expect("search").len(), 1);
    }

    #[tokio::test]
    async fn core_tools_store_and_retrieve_facts() {
        let tools = core_tools(Arc::new(InMemoryKnowledgeStore::default()));
        assert_eq!(tools.names(), vec!["get_context", "search_knowledge", "store_fact"]);

        tools
            .invoke("store_fact", json!({"content": "Acme Plumbing holds license 12345", "tags": ["contractor"]}))
            .await
            .expect("store fact");

        let found = tools.invoke("search_knowledge", json!({"query": "contractor"})).await.expect("search");
        assert_eq!(found["facts"][0]["content"], "Acme Plumbing holds license 12345");

        let context = tools.invoke("get_context", json!({"limit": 1})).await.expect("context");
        assert_eq!(context["facts"].as_array().expect("facts").len(), 1);
    }
}
