//! Action step for side effects that leave the value untouched.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Attempt, CancelSignal, PipelineContext, Result, Step, StepResult};

/// A step that runs a side-effect closure and passes its input through.
///
/// Useful for recording metadata, appending to the conversation, or logging
/// intermediate values between two transform steps. An `Err` from the closure
/// is handled like any other step error.
///
/// # Example
///
/// ```rust
/// use serde_json::Value;
/// use step_pipeline::{ActionStep, PipelineContext};
///
/// let remember = ActionStep::new("Remember", |value: &Value, ctx: &PipelineContext| {
///     ctx.set_metadata("last_value", value.clone());
///     Ok(())
/// });
/// ```
pub struct ActionStep<F> {
    name: String,
    f: F,
}

impl<F> ActionStep<F>
where
    F: Fn(&Value, &PipelineContext) -> Result<()> + Send + Sync + 'static,
{
    /// Create a new action step.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Step for ActionStep<F>
where
    F: Fn(&Value, &PipelineContext) -> Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StepResult,
        ctx: &PipelineContext,
        _attempt: Attempt<'_>,
        _cancel: &CancelSignal,
    ) -> Result<StepResult> {
        super::settle((self.f)(input.value(), ctx).map(|()| StepResult::new(input.value().clone())))
    }
}
