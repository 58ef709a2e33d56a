//! Per-run state shared by every step in a pipeline.
//!
//! A [`PipelineContext`] is created once per top-level run and threaded through
//! every middleware and step call. Parallel branches get their own context via
//! [`PipelineContext::branch`]: the conversation and path are copied, while the
//! result cache, metadata, metrics and event sink stay shared.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::events::{EventSink, NullSink, PipelineEvent};
use crate::metrics::PipelineMetrics;
use crate::pipeline::Executor;
use crate::StepResult;

/// Separator between path segments and in cache keys.
pub const PATH_SEPARATOR: &str = "/";

/// State carried through one pipeline run.
///
/// # Example
///
/// ```rust
/// use step_pipeline::PipelineContext;
/// use serde_json::json;
///
/// let ctx = PipelineContext::new();
/// ctx.set_metadata("tenant", json!("acme"));
///
/// let branch = ctx.branch("Fanout");
/// assert_eq!(branch.metadata("tenant"), Some(json!("acme")));
/// assert_eq!(branch.current_path(), "Fanout");
/// assert_eq!(branch.correlation_id(), ctx.correlation_id());
/// ```
pub struct PipelineContext {
    correlation_id: Uuid,
    path: Vec<String>,
    step_results: Arc<DashMap<String, StepResult>>,
    metadata: Arc<DashMap<String, Value>>,
    conversation: Arc<Mutex<Conversation>>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Mutex<PipelineMetrics>>,
    executor: Option<Arc<Executor>>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    /// A fresh context with a random correlation id and no event sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            path: Vec::new(),
            step_results: Arc::new(DashMap::new()),
            metadata: Arc::new(DashMap::new()),
            conversation: Arc::new(Mutex::new(Conversation::new())),
            events: Arc::new(NullSink),
            metrics: Arc::new(Mutex::new(PipelineMetrics::default())),
            executor: None,
        }
    }

    /// Use a caller-chosen correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    /// Deliver events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Start from an existing conversation.
    #[must_use]
    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = Arc::new(Mutex::new(conversation));
        self
    }

    /// The run's correlation id.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// The active nesting, joined with [`PATH_SEPARATOR`]. Empty at the root.
    pub fn current_path(&self) -> String {
        self.path.join(PATH_SEPARATOR)
    }

    /// Nesting depth; zero at the root.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub(crate) fn push_path(&mut self, segment: &str) {
        self.path.push(segment.to_string());
    }

    pub(crate) fn pop_path(&mut self) {
        self.path.pop();
    }

    pub(crate) fn truncate_path(&mut self, depth: usize) {
        self.path.truncate(depth);
    }

    /// The memoization key of `step_name` at the current path.
    pub fn key_for(&self, step_name: &str) -> String {
        if self.path.is_empty() {
            step_name.to_string()
        } else {
            format!("{}{PATH_SEPARATOR}{step_name}", self.current_path())
        }
    }

    /// The cached result stored under `key`.
    pub fn cached(&self, key: &str) -> Option<StepResult> {
        self.step_results.get(key).map(|entry| entry.value().clone())
    }

    /// The cached result of a sibling step at the current path.
    pub fn result_for(&self, step_name: &str) -> Option<StepResult> {
        self.cached(&self.key_for(step_name))
    }

    pub(crate) fn store(&self, key: String, result: StepResult) {
        self.step_results.insert(key, result);
    }

    /// All cache keys, sorted.
    pub fn result_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .step_results
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Set a metadata entry visible to every branch of the run.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Read a metadata entry.
    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.get(key).map(|entry| entry.value().clone())
    }

    /// All metadata keys, sorted.
    pub fn metadata_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.metadata.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Lock this context's conversation. Do not hold the guard across an await.
    pub fn conversation(&self) -> MutexGuard<'_, Conversation> {
        self.conversation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emit an event to the run's sink.
    pub fn emit(&self, event: PipelineEvent) {
        self.events.send(event);
    }

    /// Record LLM token usage.
    pub fn record_tokens(&self, prompt: usize, completion: usize) {
        self.update_metrics(|m| m.add_tokens(prompt, completion));
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn update_metrics(&self, f: impl FnOnce(&mut PipelineMetrics)) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut metrics);
    }

    /// The executor driving this run, present while a pipeline is running.
    pub fn executor(&self) -> Option<&Arc<Executor>> {
        self.executor.as_ref()
    }

    pub(crate) fn set_executor(&mut self, executor: Arc<Executor>) {
        self.executor = Some(executor);
    }

    /// A context for one concurrent branch running under `segment`.
    ///
    /// The branch path is the current path plus `segment`, computed here and
    /// owned by the branch. The conversation is copied; the cache, metadata,
    /// metrics, event sink and executor are shared.
    #[must_use]
    pub fn branch(&self, segment: &str) -> Self {
        let mut path = self.path.clone();
        path.push(segment.to_string());
        let conversation = self.conversation().clone();
        Self {
            correlation_id: self.correlation_id,
            path,
            step_results: Arc::clone(&self.step_results),
            metadata: Arc::clone(&self.metadata),
            conversation: Arc::new(Mutex::new(conversation)),
            events: Arc::clone(&self.events),
            metrics: Arc::clone(&self.metrics),
            executor: self.executor.clone(),
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("correlation_id", &self.correlation_id)
            .field("path", &self.current_path())
            .field("cached_results", &self.step_results.len())
            .field("metadata", &self.metadata.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use serde_json::json;

    #[test]
    fn keys_follow_the_path() {
        let mut ctx = PipelineContext::new();
        assert_eq!(ctx.key_for("Router"), "Router");
        ctx.push_path("Router");
        assert_eq!(ctx.key_for("Echo"), "Router/Echo");
        ctx.push_path("Echo");
        assert_eq!(ctx.current_path(), "Router/Echo");
        ctx.pop_path();
        ctx.pop_path();
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn branch_shares_cache_but_copies_conversation() {
        let ctx = PipelineContext::new();
        ctx.conversation().push(Role::User, "hello");

        let branch = ctx.branch("Fanout");
        branch.conversation().push(Role::Assistant, "branch only");
        branch.store(branch.key_for("Child"), StepResult::new(json!(1)));

        assert_eq!(ctx.conversation().len(), 1);
        assert_eq!(branch.conversation().len(), 2);
        assert_eq!(ctx.cached("Fanout/Child").unwrap().value(), &json!(1));
    }

    #[test]
    fn metrics_are_shared_with_branches() {
        let ctx = PipelineContext::new();
        ctx.branch("a").record_tokens(10, 5);
        assert_eq!(ctx.snapshot().total_tokens(), 15);
    }
}
