//! Retry middleware: the attempt loop and result validation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{Middleware, Next};
use crate::events::PipelineEvent;
use crate::{
    Attempt, CancelSignal, Error, PipelineContext, Result, Step, StepError, StepResult, Validation,
};

/// Runs a step up to [`Step::max_retries`] times.
///
/// Each attempt ends in one of three ways:
///
/// - `execute` returns `Err`, or a result whose error carries a fault: the
///   step is finalized with that error and no further attempt is made.
/// - a result with a fault-free error: the result is kept and handed to the
///   next attempt as [`Attempt::previous`].
/// - an error-free result: it is checked against the step's output type and
///   then by [`Step::validate`]; a rejection is attached as an error and fed
///   back like any other recoverable failure. A result passing both checks is
///   finalized and returned.
///
/// When every attempt fails recoverably, the last failed result is finalized
/// and returned. This is the innermost middleware; it never calls `next`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryMiddleware {
    delay: Duration,
}

impl RetryMiddleware {
    /// Create a retry middleware waiting `delay` between attempts.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    async fn finish(
        step: &Arc<dyn Step>,
        result: StepResult,
        ctx: &PipelineContext,
        cancel: &CancelSignal,
    ) -> StepResult {
        step.finalize(&result, ctx, cancel).await;
        result
    }

    fn reject(
        step: &dyn Step,
        ctx: &PipelineContext,
        attempt: u32,
        result: &mut StepResult,
        message: String,
    ) {
        warn!(step = %step.name(), attempt, reason = %message, "result rejected by validation");
        ctx.update_metrics(|m| m.validation_failures += 1);
        ctx.emit(PipelineEvent::ValidationFailed {
            step_name: step.name().to_string(),
            attempt,
            message: message.clone(),
        });
        result.set_error(StepError::validation(message));
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn invoke(
        &self,
        step: &Arc<dyn Step>,
        input: &StepResult,
        ctx: &PipelineContext,
        _next: Next<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let max_attempts = step.max_retries().max(1);
        let mut last: Option<StepResult> = None;

        for number in 1..=max_attempts {
            if number > 1 && !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => {
                        let result = StepResult::fatal(Error::Cancelled).attributed_to(Arc::clone(step));
                        return Ok(Self::finish(step, result, ctx, cancel).await);
                    }
                }
            }

            debug!(step = %step.name(), attempt = number, max_attempts, "executing attempt");
            let attempt = Attempt {
                number,
                previous: last.as_ref(),
            };
            let mut result = match step.execute(input, ctx, attempt, cancel).await {
                Ok(result) => result.attributed_to(Arc::clone(step)),
                Err(fault) => {
                    error!(step = %step.name(), attempt = number, error = %fault, "step faulted");
                    let result = StepResult::fatal(fault).attributed_to(Arc::clone(step));
                    return Ok(Self::finish(step, result, ctx, cancel).await);
                }
            };

            if result.is_fatal() {
                error!(step = %step.name(), attempt = number, "step failed fatally");
                return Ok(Self::finish(step, result, ctx, cancel).await);
            }
            if !result.has_error() {
                let verdict = match result.validate() {
                    Err(message) => Validation::Invalid(message),
                    Ok(()) => step.validate(&result, ctx, cancel).await,
                };
                match verdict {
                    Validation::Valid => return Ok(Self::finish(step, result, ctx, cancel).await),
                    Validation::Invalid(message) => {
                        Self::reject(step.as_ref(), ctx, number, &mut result, message);
                    }
                }
            }

            if number < max_attempts {
                let reason = result
                    .error()
                    .map(|e| e.message().to_string())
                    .unwrap_or_default();
                warn!(step = %step.name(), attempt = number, reason = %reason, "retrying step");
                ctx.update_metrics(|m| m.retries += 1);
                ctx.emit(PipelineEvent::StepRetrying {
                    step_name: step.name().to_string(),
                    attempt: number,
                    reason,
                });
            }
            last = Some(result);
        }

        warn!(step = %step.name(), max_attempts, "attempts exhausted");
        let exhausted = last.unwrap_or_else(|| {
            StepResult::failed(format!("step '{}' made no successful attempt", step.name()))
                .attributed_to(Arc::clone(step))
        });
        Ok(Self::finish(step, exhausted, ctx, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareChain, MiddlewareRegistry};
    use crate::{StepErrorKind, TypeTag};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails recoverably with a marker value until it sees its own marker fed back.
    struct SelfCorrecting {
        calls: AtomicU32,
        finalized: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Step for SelfCorrecting {
        fn name(&self) -> &str {
            "SelfCorrecting"
        }

        async fn execute(
            &self,
            _input: &StepResult,
            _ctx: &PipelineContext,
            attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match attempt.previous {
                Some(prev) if prev.value() == &json!({"draft": 1}) => {
                    Ok(StepResult::new(json!("corrected")))
                }
                _ => Ok(StepResult::new(json!({"draft": attempt.number}))
                    .with_error(StepError::logical("malformed output"))),
            }
        }

        async fn finalize(&self, result: &StepResult, _ctx: &PipelineContext, _cancel: &CancelSignal) {
            self.finalized.lock().unwrap().push(result.has_error());
        }
    }

    /// Counts calls and returns whatever outcome `respond` builds.
    struct Scripted<F> {
        calls: AtomicU32,
        max_retries: u32,
        output_type: TypeTag,
        respond: F,
    }

    impl<F> Scripted<F>
    where
        F: Fn(u32) -> Result<StepResult> + Send + Sync,
    {
        fn new(max_retries: u32, respond: F) -> Self {
            Self {
                calls: AtomicU32::new(0),
                max_retries,
                output_type: TypeTag::any(),
                respond,
            }
        }
    }

    #[async_trait]
    impl<F> Step for Scripted<F>
    where
        F: Fn(u32) -> Result<StepResult> + Send + Sync,
    {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn max_retries(&self) -> u32 {
            self.max_retries
        }

        fn output_type(&self) -> TypeTag {
            self.output_type.clone()
        }

        async fn execute(
            &self,
            _input: &StepResult,
            _ctx: &PipelineContext,
            attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(attempt.number)
        }
    }

    async fn invoke(step: Arc<dyn Step>, ctx: &PipelineContext) -> StepResult {
        let chain = MiddlewareChain::new(&MiddlewareRegistry::new(), None, Duration::ZERO);
        chain
            .invoke(&step, &StepResult::new(Value::Null), ctx, &CancelSignal::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn previous_attempt_is_fed_back() {
        let step = Arc::new(SelfCorrecting {
            calls: AtomicU32::new(0),
            finalized: Mutex::new(Vec::new()),
        });
        let ctx = PipelineContext::new();

        let result = invoke(step.clone(), &ctx).await;

        assert_eq!(result.value(), &json!("corrected"));
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*step.finalized.lock().unwrap(), [false]);
        assert_eq!(ctx.snapshot().retries, 1);
    }

    #[tokio::test]
    async fn recoverable_errors_stop_at_the_ceiling() {
        let step = Arc::new(Scripted::new(3, |n| Ok(StepResult::failed(format!("attempt {n}")))));
        let ctx = PipelineContext::new();

        let result = invoke(step.clone(), &ctx).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.error().unwrap().message(), "attempt 3");
        assert_eq!(result.step_name(), Some("Scripted"));
        assert_eq!(ctx.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn faulted_results_are_not_retried() {
        let step = Arc::new(Scripted::new(5, |_| {
            Ok(StepResult::fatal(Error::Execution("quota exceeded".into())))
        }));
        let result = invoke(step.clone(), &PipelineContext::new()).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert!(result.is_fatal());
    }

    #[tokio::test]
    async fn thrown_faults_become_fatal_results() {
        let step = Arc::new(Scripted::new(5, |_| Err(Error::Execution("socket closed".into()))));
        let result = invoke(step.clone(), &PipelineContext::new()).await;

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert!(result.is_fatal());
        assert!(matches!(
            result.error().and_then(StepError::original),
            Some(Error::Execution(_))
        ));
    }

    #[tokio::test]
    async fn structural_validation_failures_are_retried() {
        let mut step = Scripted::new(2, |n| {
            if n == 1 {
                Ok(StepResult::new(json!("not a number")))
            } else {
                Ok(StepResult::new(json!(42)))
            }
        });
        step.output_type = TypeTag::of::<u32>();
        let step = Arc::new(step);
        let ctx = PipelineContext::new();

        let result = invoke(step.clone(), &ctx).await;

        assert!(!result.has_error());
        assert_eq!(result.value(), &json!(42));
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.snapshot().validation_failures, 1);
    }

    /// Declares a numeric output but forwards its input unchanged.
    struct Forwarding;

    #[async_trait]
    impl Step for Forwarding {
        fn name(&self) -> &str {
            "Forwarding"
        }

        fn max_retries(&self) -> u32 {
            2
        }

        fn output_type(&self) -> TypeTag {
            TypeTag::of::<u32>()
        }

        async fn execute(
            &self,
            input: &StepResult,
            _ctx: &PipelineContext,
            _attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<StepResult> {
            Ok(input.derive(json!("not a number")))
        }
    }

    #[tokio::test]
    async fn derived_results_are_checked_against_the_running_step() {
        let step: Arc<dyn Step> = Arc::new(Forwarding);
        let upstream: Arc<dyn Step> = Arc::new(crate::NoopStep::new("Upstream"));
        let input = StepResult::new(json!("text")).attributed_to(upstream);
        let chain = MiddlewareChain::new(&MiddlewareRegistry::new(), None, Duration::ZERO);
        let ctx = PipelineContext::new();

        let result = chain
            .invoke(&step, &input, &ctx, &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(result.step_name(), Some("Forwarding"));
        assert_eq!(result.error().unwrap().kind(), StepErrorKind::Validation);
        assert_eq!(ctx.snapshot().validation_failures, 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_retry_delay() {
        let step = Arc::new(Scripted::new(3, |_| Ok(StepResult::failed("try again"))));
        let dyn_step: Arc<dyn Step> = step.clone();
        let chain = MiddlewareChain::new(&MiddlewareRegistry::new(), None, Duration::from_secs(10));
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = chain
            .invoke(&dyn_step, &StepResult::new(Value::Null), &PipelineContext::new(), &cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.error().and_then(StepError::original),
            Some(Error::Cancelled)
        ));
    }

    struct Picky;

    #[async_trait]
    impl Step for Picky {
        fn name(&self) -> &str {
            "Picky"
        }

        fn max_retries(&self) -> u32 {
            2
        }

        async fn execute(
            &self,
            _input: &StepResult,
            _ctx: &PipelineContext,
            attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<StepResult> {
            Ok(StepResult::new(json!(attempt.number)))
        }

        async fn validate(
            &self,
            _result: &StepResult,
            _ctx: &PipelineContext,
            _cancel: &CancelSignal,
        ) -> Validation {
            Validation::invalid("never good enough")
        }
    }

    #[tokio::test]
    async fn semantic_rejection_exhausts_with_validation_error() {
        let result = invoke(Arc::new(Picky), &PipelineContext::new()).await;

        let err = result.error().unwrap();
        assert_eq!(err.kind(), StepErrorKind::Validation);
        assert_eq!(err.message(), "never good enough");
        assert_eq!(result.value(), &json!(2));
    }
}
