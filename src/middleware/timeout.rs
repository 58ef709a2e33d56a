//! Timeout middleware: one time budget per step execution.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{Middleware, Next};
use crate::{CancelSignal, Error, PipelineContext, Result, Step, StepError, StepResult};

/// Bounds a step execution by [`Step::timeout`], or the pipeline default.
///
/// The budget covers every retry attempt of the step together. When it runs
/// out, the bounded child signal is cancelled, the in-flight attempt is
/// dropped, and a timeout error result (not a fault) is returned. If the
/// caller's own signal is what fired, [`Error::Cancelled`] is returned
/// instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeoutMiddleware {
    default: Option<Duration>,
}

impl TimeoutMiddleware {
    /// Create a timeout middleware with an optional default budget.
    pub fn new(default: Option<Duration>) -> Self {
        Self { default }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn invoke(
        &self,
        step: &Arc<dyn Step>,
        input: &StepResult,
        ctx: &PipelineContext,
        next: Next<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let Some(budget) = step.timeout().or(self.default) else {
            return next.run(step, input, ctx, cancel).await;
        };

        let bounded = cancel.child();
        match tokio::time::timeout(budget, next.run(step, input, ctx, &bounded)).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                bounded.cancel();
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                warn!(step = %step.name(), budget_ms = budget.as_millis(), "step timed out");
                ctx.update_metrics(|m| m.timeouts += 1);

                let timeout = Error::Timeout {
                    scope: step.name().to_string(),
                    after: budget,
                };
                let result = StepResult::new(Value::Null)
                    .with_error(StepError::timeout(timeout.to_string()))
                    .attributed_to(Arc::clone(step));
                step.finalize(&result, ctx, cancel).await;
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareChain, MiddlewareRegistry};
    use crate::{LambdaStep, StepErrorKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chain(default: Option<Duration>) -> MiddlewareChain {
        MiddlewareChain::new(&MiddlewareRegistry::new(), default, Duration::ZERO)
    }

    #[tokio::test]
    async fn slow_step_yields_timeout_result() {
        let step: Arc<dyn Step> = Arc::new(
            LambdaStep::new("Slow", |v: Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<Value, Error>(v)
            })
            .with_timeout(Duration::from_millis(20)),
        );
        let ctx = PipelineContext::new();

        let result = chain(None)
            .invoke(&step, &StepResult::new(json!(1)), &ctx, &CancelSignal::new())
            .await
            .unwrap();

        let err = result.error().unwrap();
        assert_eq!(err.kind(), StepErrorKind::Timeout);
        assert!(!result.is_fatal());
        assert_eq!(ctx.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn budget_is_shared_by_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step: Arc<dyn Step> = Arc::new(
            LambdaStep::new("Retrying", move |_: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Err::<Value, _>(Error::Recoverable("not yet".into()))
                }
            })
            .with_max_retries(10),
        );

        let result = chain(Some(Duration::from_millis(100)))
            .invoke(&step, &StepResult::new(json!(1)), &PipelineContext::new(), &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(result.error().unwrap().kind(), StepErrorKind::Timeout);
        assert!(calls.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn caller_cancellation_is_not_a_timeout() {
        let step: Arc<dyn Step> = Arc::new(
            LambdaStep::new("Stubborn", |v: Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<Value, Error>(v)
            })
            .with_timeout(Duration::from_millis(50)),
        );
        let ctx = PipelineContext::new();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let outcome = chain(None)
            .invoke(&step, &StepResult::new(json!(1)), &ctx, &cancel)
            .await;

        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert_eq!(ctx.snapshot().timeouts, 0);
    }

    #[tokio::test]
    async fn fast_step_is_untouched() {
        let step: Arc<dyn Step> = Arc::new(LambdaStep::new("Fast", |v: Value| async move { Ok::<Value, Error>(v) }));
        let result = chain(Some(Duration::from_secs(1)))
            .invoke(&step, &StepResult::new(json!("ok")), &PipelineContext::new(), &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(result.value(), &json!("ok"));
    }
}
