//! Sequential grouping of steps.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{Attempt, CancelSignal, PipelineContext, Result, Step, StepResult};

/// A transparent container for an ordered list of steps.
///
/// A group does not run its children itself. It returns its input unchanged
/// and hands the children back to the pipeline as `next_steps`, which runs
/// them inline at the group's own path. Children therefore share cache keys
/// with the group's siblings and can read their results with
/// [`PipelineContext::result_for`].
///
/// The group gets a single attempt; its children retry individually.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use step_pipeline::{GroupStep, NoopStep};
///
/// let group = GroupStep::new("Prepare")
///     .with_step(Arc::new(NoopStep::new("Load")))
///     .with_step(Arc::new(NoopStep::new("Clean")));
/// assert_eq!(group.steps().len(), 2);
/// ```
pub struct GroupStep {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl GroupStep {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Create a group from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// The grouped steps in order.
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }
}

#[async_trait]
impl Step for GroupStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn is_transparent(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        input: &StepResult,
        _ctx: &PipelineContext,
        _attempt: Attempt<'_>,
        _cancel: &CancelSignal,
    ) -> Result<StepResult> {
        Ok(StepResult::new(input.value().clone()).with_next_steps(self.steps.clone()))
    }
}
