//! Concurrent fan-out over independent branches.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::{
    Attempt, CancelSignal, Error, PipelineContext, Result, Step, StepError, StepResult,
};

/// A step that runs each branch concurrently on the same input.
///
/// Every branch gets its own [`PipelineContext::branch`] under this step's
/// name: a private copy of the conversation, and the shared cache, metadata
/// and metrics. A branch runs through the same executor as the top level, so
/// its `next_steps` are honored.
///
/// The output is an object keyed by branch name. All branches run to
/// completion; if any of them ends with an error, the aggregate carries one
/// combined error, a fault if any branch error was fatal.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use step_pipeline::{LambdaStep, ParallelStep, Pipeline, Step};
/// use serde_json::{json, Value};
///
/// # tokio_test::block_on(async {
/// let fanout = ParallelStep::new("Fanout")
///     .with_branch(Arc::new(LambdaStep::new("Len", |v: Value| async move {
///         Ok::<Value, step_pipeline::Error>(json!(v.as_str().unwrap_or_default().len()))
///     })))
///     .with_branch(Arc::new(LambdaStep::new("Upper", |v: Value| async move {
///         Ok::<Value, step_pipeline::Error>(json!(v.as_str().unwrap_or_default().to_uppercase()))
///     })));
///
/// let steps: Vec<Arc<dyn Step>> = vec![Arc::new(fanout)];
/// let (result, _) = Pipeline::new().run(&steps, "abc".to_string()).await.unwrap();
/// assert_eq!(result.value(), &json!({"Len": 3, "Upper": "ABC"}));
/// # });
/// ```
pub struct ParallelStep {
    name: String,
    branches: Vec<Arc<dyn Step>>,
}

impl ParallelStep {
    /// Create a parallel step with no branches.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
        }
    }

    /// Create a parallel step from a list of branches.
    pub fn from_steps(name: impl Into<String>, branches: Vec<Arc<dyn Step>>) -> Self {
        Self {
            name: name.into(),
            branches,
        }
    }

    /// Add a branch.
    #[must_use]
    pub fn with_branch(mut self, branch: Arc<dyn Step>) -> Self {
        self.branches.push(branch);
        self
    }

    /// The branches in declaration order.
    pub fn branches(&self) -> &[Arc<dyn Step>] {
        &self.branches
    }
}

#[async_trait]
impl Step for ParallelStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn execute(
        &self,
        input: &StepResult,
        ctx: &PipelineContext,
        _attempt: Attempt<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let executor = ctx.executor().cloned().ok_or_else(|| {
            Error::Configuration(format!(
                "parallel step '{}' must run inside a pipeline",
                self.name
            ))
        })?;
        debug!(step = %self.name, branches = self.branches.len(), "fanning out");

        let runs = self.branches.iter().map(|branch| {
            let executor = Arc::clone(&executor);
            let mut branch_ctx = ctx.branch(&self.name);
            let input = input.clone();
            let branch = Arc::clone(branch);
            async move {
                let name = branch.name().to_string();
                let result = executor
                    .run_steps(vec![branch], input, &mut branch_ctx, cancel)
                    .await;
                (name, result)
            }
        });
        let outcomes = join_all(runs).await;

        let mut values = Map::new();
        let mut failures = Vec::new();
        let mut fatal = false;
        for (name, result) in outcomes {
            if let Some(error) = result.error() {
                fatal |= error.is_fatal();
                failures.push(format!("{name}: {}", error.message()));
            }
            values.insert(name, result.into_value());
        }

        let aggregate = StepResult::new(Value::Object(values));
        if failures.is_empty() {
            return Ok(aggregate);
        }
        let combined = failures.join("; ");
        let error = if fatal {
            StepError::fault(Error::Execution(combined))
        } else {
            StepError::logical(combined)
        };
        Ok(aggregate.with_error(error))
    }
}
