//! Structured pipeline execution events and the sinks that receive them.
//!
//! Events are fire-and-forget: a sink must never block or fail the run.
//! Transport-backed sinks (consoles, channels, buses) live outside this crate
//! and implement [`EventSink`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Free-form tags a step attaches to its span and events.
pub type Tags = BTreeMap<String, serde_json::Value>;

/// Events that can be emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    /// A top-level pipeline run has started.
    PipelineStarted {
        /// Name of the pipeline.
        pipeline: String,
        /// Correlation id of the run.
        correlation_id: String,
        /// Number of top-level steps.
        step_count: usize,
    },
    /// A top-level pipeline run has finished.
    PipelineCompleted {
        /// Name of the pipeline.
        pipeline: String,
        /// Correlation id of the run.
        correlation_id: String,
        /// Whether the final result is free of errors.
        success: bool,
        /// Duration of the run in milliseconds.
        duration_ms: u128,
    },
    /// A step has started execution.
    StepStarted {
        /// Name of the step.
        step_name: String,
        /// Path the step runs under.
        path: String,
        /// Declared input type tag.
        input_type: String,
        /// Tags attached by the step.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        tags: Tags,
    },
    /// A step has finished, successfully or not.
    StepCompleted {
        /// Name of the step.
        step_name: String,
        /// Path the step ran under.
        path: String,
        /// Whether the step produced an error-free result.
        success: bool,
        /// Error message when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Duration of every attempt combined, in milliseconds.
        duration_ms: u128,
        /// Tags attached by the step.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        tags: Tags,
    },
    /// A step attempt failed recoverably and will be retried.
    StepRetrying {
        /// Name of the step.
        step_name: String,
        /// The attempt that just failed.
        attempt: u32,
        /// Why it failed.
        reason: String,
    },
    /// Validation of a result finished.
    ValidationFailed {
        /// Name of the step.
        step_name: String,
        /// The attempt whose result was rejected.
        attempt: u32,
        /// Why it was rejected.
        message: String,
    },
    /// A routing step picked its successor.
    RouteSelected {
        /// Name of the routing step.
        step_name: String,
        /// Name of the selected successor.
        target: String,
    },
    /// A memoized result was reused instead of running the step.
    CacheHit {
        /// The cache key that was reused.
        key: String,
    },
}

/// A timestamped trace entry containing a pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The recorded event.
    #[serde(flatten)]
    pub event: PipelineEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: PipelineEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}

/// Receiver of pipeline progress events.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block and must not fail.
    fn send(&self, event: PipelineEvent);
}

/// A sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: PipelineEvent) {}
}

/// A sink that keeps every event in memory, in arrival order.
///
/// # Example
///
/// ```rust
/// use step_pipeline::{EventSink, PipelineEvent, RecordingSink};
///
/// let sink = RecordingSink::new();
/// sink.send(PipelineEvent::CacheHit { key: "Summarize".to_string() });
/// assert_eq!(sink.snapshot().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<TraceEntry>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Just the events, without timestamps.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.snapshot().into_iter().map(|e| e.event).collect()
    }

    /// Clear all recorded entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: PipelineEvent) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(TraceEntry::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_entry_serialization() {
        let entry = TraceEntry::new(PipelineEvent::StepStarted {
            step_name: "Summarize".to_string(),
            path: String::new(),
            input_type: "String".to_string(),
            tags: Tags::new(),
        });

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"StepStarted\""));
        assert!(json.contains("\"step_name\":\"Summarize\""));
        assert!(json.contains("\"timestamp\":"));
        assert!(!json.contains("\"tags\""));
    }

    #[test]
    fn test_route_event() {
        let event = PipelineEvent::RouteSelected {
            step_name: "Router".to_string(),
            target: "Echo".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"RouteSelected\""));
        assert!(json.contains("\"target\":\"Echo\""));
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.send(PipelineEvent::CacheHit { key: "a".into() });
        sink.send(PipelineEvent::CacheHit { key: "b".into() });

        let keys: Vec<_> = sink
            .events()
            .into_iter()
            .map(|e| match e {
                PipelineEvent::CacheHit { key } => key,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(keys, ["a", "b"]);

        sink.clear();
        assert!(sink.snapshot().is_empty());
    }
}
