//! A step that does nothing.

use async_trait::async_trait;

use crate::{Attempt, CancelSignal, PipelineContext, Result, Step, StepResult};

/// Returns its input unchanged.
///
/// Also stands in as the producer of a pipeline's initial value.
#[derive(Debug, Clone)]
pub struct NoopStep {
    name: String,
}

impl NoopStep {
    /// Create a no-op step with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Step for NoopStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn execute(
        &self,
        input: &StepResult,
        _ctx: &PipelineContext,
        _attempt: Attempt<'_>,
        _cancel: &CancelSignal,
    ) -> Result<StepResult> {
        Ok(StepResult::new(input.value().clone()))
    }
}
