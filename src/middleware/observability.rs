//! Observability middleware: span, events and metrics around every step.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use super::{Middleware, Next};
use crate::events::{PipelineEvent, Tags};
use crate::{CancelSignal, PipelineContext, Result, Step, StepResult};

/// Wraps a step execution, including all of its attempts, in a trace span.
///
/// For each execution it emits:
/// - a [`PipelineEvent::StepStarted`] before the rest of the chain runs
/// - a [`PipelineEvent::StepCompleted`] with the outcome and elapsed time,
///   whether the step succeeded, returned an error result, or faulted
///
/// and records the duration and outcome in the run's metrics. A fault is
/// passed on unchanged after it has been recorded.
///
/// Steps attach their own fields through [`Step::enrich_started`] and
/// [`Step::enrich_completed`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservabilityMiddleware;

#[async_trait]
impl Middleware for ObservabilityMiddleware {
    fn name(&self) -> &str {
        "observability"
    }

    async fn invoke(
        &self,
        step: &Arc<dyn Step>,
        input: &StepResult,
        ctx: &PipelineContext,
        next: Next<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let path = ctx.current_path();
        let mut tags = Tags::new();
        step.enrich_started(input, &mut tags);

        let span = info_span!(
            "step",
            step = %step.name(),
            path = %path,
            correlation_id = %ctx.correlation_id(),
            tags = ?tags,
        );

        async move {
            ctx.update_metrics(|m| m.steps_started += 1);
            ctx.emit(PipelineEvent::StepStarted {
                step_name: step.name().to_string(),
                path: path.clone(),
                input_type: step.input_type().to_string(),
                tags,
            });
            debug!("step started");

            let start = Instant::now();
            let outcome = next.run(step, input, ctx, cancel).await;
            let elapsed = start.elapsed();

            let mut tags = Tags::new();
            let error = match &outcome {
                Ok(result) => {
                    step.enrich_completed(result, &mut tags);
                    result.error().map(|e| e.message().to_string())
                }
                Err(fault) => Some(fault.to_string()),
            };
            let success = error.is_none();

            ctx.update_metrics(|m| {
                m.record_step(step.name(), elapsed, success);
                if let Some(message) = &error {
                    m.record_failure(format!("{}: {message}", step.name()));
                }
            });
            match &error {
                None => debug!(duration_ms = elapsed.as_millis(), "step completed"),
                Some(message) => warn!(
                    duration_ms = elapsed.as_millis(),
                    error = %message,
                    "step completed with error"
                ),
            }
            ctx.emit(PipelineEvent::StepCompleted {
                step_name: step.name().to_string(),
                path,
                success,
                error,
                duration_ms: elapsed.as_millis(),
                tags,
            });

            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::middleware::{MiddlewareChain, MiddlewareRegistry};
    use crate::{Attempt, Error};
    use serde_json::json;
    use std::time::Duration;

    struct Tagged;

    #[async_trait]
    impl Step for Tagged {
        fn name(&self) -> &str {
            "Tagged"
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

        fn enrich_completed(&self, result: &StepResult, tags: &mut Tags) {
            tags.insert("echoed".into(), result.value().clone());
        }
    }

    struct Faulty;

    #[async_trait]
    impl Step for Faulty {
        fn name(&self) -> &str {
            "Faulty"
        }

        async fn execute(
            &self,
            _input: &StepResult,
            _ctx: &PipelineContext,
            _attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<StepResult> {
            Err(Error::Execution("provider unavailable".into()))
        }
    }

    async fn run_chain(step: Arc<dyn Step>, sink: Arc<RecordingSink>) -> PipelineContext {
        let ctx = PipelineContext::new().with_event_sink(sink);
        let chain = MiddlewareChain::new(&MiddlewareRegistry::new(), None, Duration::ZERO);
        let _ = chain
            .invoke(&step, &StepResult::new(json!("hi")), &ctx, &CancelSignal::new())
            .await;
        ctx
    }

    #[tokio::test]
    async fn emits_started_and_completed_with_tags() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = run_chain(Arc::new(Tagged), sink.clone()).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PipelineEvent::StepStarted { step_name, .. } if step_name == "Tagged"));
        match &events[1] {
            PipelineEvent::StepCompleted { success, tags, .. } => {
                assert!(*success);
                assert_eq!(tags.get("echoed"), Some(&json!("hi")));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let metrics = ctx.snapshot();
        assert_eq!(metrics.steps_started, 1);
        assert_eq!(metrics.steps_completed, 1);
        assert_eq!(metrics.step_durations["Tagged"].count, 1);
    }

    #[tokio::test]
    async fn records_failures_from_faulting_steps() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = run_chain(Arc::new(Faulty), sink.clone()).await;

        match sink.events().last() {
            Some(PipelineEvent::StepCompleted { success, error, .. }) => {
                assert!(!*success);
                assert!(error.as_deref().unwrap().contains("provider unavailable"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let metrics = ctx.snapshot();
        assert_eq!(metrics.steps_failed, 1);
        assert!(metrics.has_failures());
    }
}
