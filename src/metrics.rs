//! Metrics collection for pipeline execution.
//!
//! `PipelineMetrics` counts runs, step executions, retries, timeouts and
//! failures, keeps a duration summary per step, and tracks LLM token usage
//! reported by steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Duration summary for one step name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    /// Number of recorded executions.
    pub count: u64,
    /// Sum of all recorded durations in milliseconds.
    pub total_ms: u128,
    /// Longest recorded duration in milliseconds.
    pub max_ms: u128,
}

impl DurationStats {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis();
        self.count += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    /// Mean duration in milliseconds, or zero when nothing was recorded.
    pub fn mean_ms(&self) -> u128 {
        if self.count == 0 {
            0
        } else {
            self.total_ms / u128::from(self.count)
        }
    }
}

/// Aggregated metrics for pipeline execution.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Top-level pipeline runs started.
    pub pipeline_runs: usize,
    /// Top-level pipeline runs that ended with an error result.
    pub pipeline_failures: usize,
    /// Step executions started (each counts once, however many attempts).
    pub steps_started: usize,
    /// Step executions that ended with an error-free result.
    pub steps_completed: usize,
    /// Step executions that ended with an error result or a fault.
    pub steps_failed: usize,
    /// Attempts that failed recoverably and were retried.
    pub retries: usize,
    /// Results rejected by structural or semantic validation.
    pub validation_failures: usize,
    /// Steps or pipelines whose time budget ran out.
    pub timeouts: usize,
    /// Memoized results reused instead of executing a step.
    pub cache_hits: usize,
    /// Duration summary per step name.
    pub step_durations: BTreeMap<String, DurationStats>,
    /// Duration summary of whole pipeline runs.
    pub pipeline_duration: DurationStats,
    /// Collected failure messages.
    pub failures: Vec<String>,
    /// Total prompt tokens consumed across all steps.
    pub prompt_token_count: usize,
    /// Total completion tokens generated across all steps.
    pub completion_token_count: usize,
    /// Total tokens (prompt + completion) across all steps.
    pub total_token_count: usize,
}

impl PipelineMetrics {
    /// Record both prompt and completion tokens.
    pub fn add_tokens(&mut self, prompt: usize, completion: usize) {
        self.prompt_token_count += prompt;
        self.completion_token_count += completion;
        self.total_token_count += prompt + completion;
    }

    /// Record a finished step execution.
    pub fn record_step(&mut self, step_name: &str, elapsed: Duration, success: bool) {
        if success {
            self.steps_completed += 1;
        } else {
            self.steps_failed += 1;
        }
        self.step_durations
            .entry(step_name.to_string())
            .or_default()
            .record(elapsed);
    }

    /// Record a finished pipeline run.
    pub fn record_pipeline(&mut self, elapsed: Duration, success: bool) {
        if !success {
            self.pipeline_failures += 1;
        }
        self.pipeline_duration.record(elapsed);
    }

    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Get the total number of tokens used.
    pub fn total_tokens(&self) -> usize {
        self.total_token_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_durations_accumulate_per_name() {
        let mut m = PipelineMetrics::default();
        m.record_step("Summarize", Duration::from_millis(10), true);
        m.record_step("Summarize", Duration::from_millis(30), false);

        let stats = &m.step_durations["Summarize"];
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_ms, 30);
        assert_eq!(stats.mean_ms(), 20);
        assert_eq!(m.steps_completed, 1);
        assert_eq!(m.steps_failed, 1);
    }

    #[test]
    fn tokens_sum_into_total() {
        let mut m = PipelineMetrics::default();
        m.add_tokens(120, 30);
        m.add_tokens(5, 5);
        assert_eq!(m.total_tokens(), 160);
        assert_eq!(m.prompt_token_count, 125);
    }
}
