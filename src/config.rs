//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on `next_steps` nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Settings shared by every run of a [`Pipeline`](crate::Pipeline).
///
/// Missing fields take their defaults when deserialized:
///
/// ```rust
/// use step_pipeline::PipelineConfig;
///
/// let config: PipelineConfig = serde_json::from_str(r#"{
///     "name": "triage",
///     "default_timeout_ms": 30000
/// }"#).unwrap();
/// assert_eq!(config.max_depth, 32);
/// assert_eq!(config.retry_delay_ms, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name used in spans, events and logs.
    pub name: String,
    /// Budget for steps that declare no timeout of their own.
    pub default_timeout_ms: Option<u64>,
    /// Budget for a whole run.
    pub pipeline_timeout_ms: Option<u64>,
    /// Pause between two attempts of the same step.
    pub retry_delay_ms: u64,
    /// Maximum `next_steps` nesting before a run is aborted.
    pub max_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            default_timeout_ms: None,
            pipeline_timeout_ms: None,
            retry_delay_ms: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl PipelineConfig {
    /// Default step budget as a `Duration`.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Whole-run budget as a `Duration`.
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_ms.map(Duration::from_millis)
    }

    /// Delay between attempts as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
