//! The pipeline: entry checks, the recursive executor and run-level timing.

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::events::PipelineEvent;
use crate::middleware::{Middleware, MiddlewareChain, MiddlewareRegistry};
use crate::result::{DefaultResultFactory, StepResultFactory};
use crate::{
    CancelSignal, Error, NoopStep, PipelineContext, PipelineMetrics, Result, Step, StepError,
    StepResult, TypeTag,
};

/// Name of the synthetic step credited with a run's initial value.
pub const INPUT_STEP_NAME: &str = "input";

/// Runs step lists against one middleware chain.
///
/// For each step the executor looks up the memoized result at the current
/// path, or invokes the chain and stores whatever comes back. A result with
/// an error ends the run. A result carrying `next_steps` is expanded in place
/// before the next sibling starts: one level below the step's name, or at the
/// same path for transparent steps such as [`GroupStep`](crate::GroupStep).
///
/// Steps that run sub-pipelines of their own, like
/// [`ParallelStep`](crate::ParallelStep), reach the executor through
/// [`PipelineContext::executor`].
pub struct Executor {
    chain: MiddlewareChain,
    max_depth: usize,
}

impl Executor {
    /// Create an executor over `chain`, aborting beyond `max_depth` nested lists.
    pub fn new(chain: MiddlewareChain, max_depth: usize) -> Self {
        Self { chain, max_depth }
    }

    /// Run `steps` in order, starting from `input`.
    ///
    /// Never fails: faults that escape the chain become fatal error results.
    pub fn run_steps<'a>(
        &'a self,
        steps: Vec<Arc<dyn Step>>,
        input: StepResult,
        ctx: &'a mut PipelineContext,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, StepResult> {
        self.expand(steps, input, ctx, cancel, 0)
    }

    fn expand<'a>(
        &'a self,
        steps: Vec<Arc<dyn Step>>,
        input: StepResult,
        ctx: &'a mut PipelineContext,
        cancel: &'a CancelSignal,
        level: usize,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if level > self.max_depth || ctx.depth() > self.max_depth {
                error!(path = %ctx.current_path(), max_depth = self.max_depth, "step nesting too deep");
                return StepResult::fatal(Error::Configuration(format!(
                    "step nesting exceeded {} levels at '{}'",
                    self.max_depth,
                    ctx.current_path()
                )));
            }

            let mut current = input;
            for step in steps {
                let key = ctx.key_for(step.name());

                let (result, next) = match ctx.cached(&key) {
                    Some(mut cached) => {
                        cached.take_next_steps();
                        debug!(key = %key, "reusing memoized result");
                        ctx.update_metrics(|m| m.cache_hits += 1);
                        ctx.emit(PipelineEvent::CacheHit { key });
                        (cached, Vec::new())
                    }
                    None => {
                        let mut result = match self.chain.invoke(&step, &current, ctx, cancel).await
                        {
                            Ok(result) => result,
                            Err(fault) => {
                                error!(step = %step.name(), error = %fault, "fault escaped the middleware chain");
                                StepResult::fatal(fault).attributed_to(Arc::clone(&step))
                            }
                        };
                        let next = result.take_next_steps();
                        ctx.store(key, result.clone());
                        (result, next)
                    }
                };

                if result.has_error() {
                    return result;
                }
                if next.is_empty() {
                    current = result;
                    continue;
                }

                let nested = !step.is_transparent();
                if nested {
                    ctx.push_path(step.name());
                }
                let subtree = self.expand(next, result, ctx, cancel, level + 1).await;
                if nested {
                    ctx.pop_path();
                }
                if subtree.has_error() {
                    return subtree;
                }
                current = subtree;
            }
            current
        })
    }
}

/// A configured pipeline, reusable across runs.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use step_pipeline::{LambdaStep, Pipeline, Step};
/// use serde_json::{json, Value};
///
/// # tokio_test::block_on(async {
/// let steps: Vec<Arc<dyn Step>> = vec![
///     Arc::new(LambdaStep::new("Double", |x: Value| async move {
///         Ok::<Value, step_pipeline::Error>(json!(x.as_i64().unwrap_or_default() * 2))
///     })),
///     Arc::new(LambdaStep::new("AddTen", |x: Value| async move {
///         Ok::<Value, step_pipeline::Error>(json!(x.as_i64().unwrap_or_default() + 10))
///     })),
/// ];
///
/// let pipeline = Pipeline::builder().with_name("DoubleAndAdd").build();
/// let (result, metrics) = pipeline.run(&steps, 5).await.unwrap();
///
/// assert_eq!(result.value(), &json!(20));
/// assert_eq!(metrics.steps_completed, 2);
/// # });
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    middlewares: MiddlewareRegistry,
    factory: Arc<dyn StepResultFactory>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Pipeline {
    /// A pipeline with default configuration and no extra middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// A pipeline configured from `config`.
    pub fn from_config(config: PipelineConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    /// Returns the name of this pipeline.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The pipeline's configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The caller-registered middlewares.
    pub fn middlewares(&self) -> &MiddlewareRegistry {
        &self.middlewares
    }

    /// Run `steps` on `input`, returning the final result and the run's metrics.
    ///
    /// A fresh [`PipelineContext`] is created for each invocation. `Err` means
    /// the pipeline could not start; step failures are reported through
    /// [`StepResult::has_error`].
    pub async fn run<T>(
        &self,
        steps: &[Arc<dyn Step>],
        input: T,
    ) -> Result<(StepResult, PipelineMetrics)>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let mut ctx = PipelineContext::new();
        let result = self
            .run_with_ctx(&mut ctx, steps, input, &CancelSignal::new())
            .await?;
        Ok((result, ctx.snapshot()))
    }

    /// Run with a caller-provided context and cancellation signal.
    ///
    /// Useful to inspect the result cache afterwards, attach an event sink, or
    /// reuse memoized results across runs.
    pub async fn run_with_ctx<T>(
        &self,
        ctx: &mut PipelineContext,
        steps: &[Arc<dyn Step>],
        input: T,
        cancel: &CancelSignal,
    ) -> Result<StepResult>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let value = serde_json::to_value(&input)?;
        self.run_value(ctx, steps, value, TypeTag::of::<T>(), cancel)
            .await
    }

    /// Run on an untyped value declared to have shape `input_type`.
    pub async fn run_value(
        &self,
        ctx: &mut PipelineContext,
        steps: &[Arc<dyn Step>],
        input: Value,
        input_type: TypeTag,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let first = steps.first().ok_or_else(|| {
            Error::Configuration(format!("pipeline '{}' has no steps", self.name()))
        })?;
        if !first.input_type().accepts(&input_type) {
            return Err(Error::Configuration(format!(
                "step '{}' expects {} but the pipeline was given {}",
                first.name(),
                first.input_type(),
                input_type
            )));
        }
        for pair in steps.windows(2) {
            let (produced, expected) = (pair[0].output_type(), pair[1].input_type());
            if !expected.accepts(&produced) {
                warn!(
                    from = %pair[0].name(),
                    to = %pair[1].name(),
                    produced = %produced,
                    expected = %expected,
                    "adjacent steps disagree on type"
                );
            }
        }

        let origin: Arc<dyn Step> = Arc::new(NoopStep::new(INPUT_STEP_NAME));
        let initial = self.factory.create(&input_type, origin, Some(input), None)?;

        let chain = MiddlewareChain::new(
            &self.middlewares,
            self.config.default_timeout(),
            self.config.retry_delay(),
        );
        let executor = Arc::new(Executor::new(chain, self.config.max_depth));
        ctx.set_executor(Arc::clone(&executor));

        let span = info_span!(
            "pipeline",
            pipeline = %self.name(),
            correlation_id = %ctx.correlation_id()
        );
        async move {
            ctx.update_metrics(|m| m.pipeline_runs += 1);
            ctx.emit(PipelineEvent::PipelineStarted {
                pipeline: self.name().to_string(),
                correlation_id: ctx.correlation_id().to_string(),
                step_count: steps.len(),
            });
            info!(steps = steps.len(), "pipeline started");

            let start = Instant::now();
            let result = match self.config.pipeline_timeout() {
                None => executor.run_steps(steps.to_vec(), initial, ctx, cancel).await,
                Some(budget) => self.bounded(&executor, steps, initial, ctx, cancel, budget).await,
            };
            let elapsed = start.elapsed();
            let success = !result.has_error();

            ctx.update_metrics(|m| m.record_pipeline(elapsed, success));
            ctx.emit(PipelineEvent::PipelineCompleted {
                pipeline: self.name().to_string(),
                correlation_id: ctx.correlation_id().to_string(),
                success,
                duration_ms: elapsed.as_millis(),
            });
            match result.error() {
                None => info!(duration_ms = elapsed.as_millis(), "pipeline completed"),
                Some(e) => warn!(
                    step = result.step_name().unwrap_or_default(),
                    error = %e,
                    "pipeline failed"
                ),
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn bounded(
        &self,
        executor: &Executor,
        steps: &[Arc<dyn Step>],
        initial: StepResult,
        ctx: &mut PipelineContext,
        cancel: &CancelSignal,
        budget: Duration,
    ) -> StepResult {
        let depth = ctx.depth();
        let signal = cancel.child();
        let outcome = tokio::time::timeout(
            budget,
            executor.run_steps(steps.to_vec(), initial, ctx, &signal),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_elapsed) => {
                signal.cancel();
                ctx.truncate_path(depth);
                warn!(budget_ms = budget.as_millis(), "pipeline timed out");
                ctx.update_metrics(|m| m.timeouts += 1);
                let timeout = Error::Timeout {
                    scope: self.name().to_string(),
                    after: budget,
                };
                StepResult::new(Value::Null).with_error(StepError::timeout(timeout.to_string()))
            }
        }
    }
}

/// Builder for configuring and constructing a [`Pipeline`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use step_pipeline::Pipeline;
///
/// let pipeline = Pipeline::builder()
///     .with_name("triage")
///     .with_default_timeout(Duration::from_secs(30))
///     .with_max_depth(8)
///     .build();
/// assert_eq!(pipeline.name(), "triage");
/// assert_eq!(pipeline.config().default_timeout_ms, Some(30_000));
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    middlewares: MiddlewareRegistry,
    factory: Arc<dyn StepResultFactory>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            config: PipelineConfig::default(),
            middlewares: MiddlewareRegistry::new(),
            factory: Arc::new(DefaultResultFactory),
        }
    }
}

impl PipelineBuilder {
    /// Set a human-readable name for the pipeline.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a middleware ahead of the built-in ones.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.register(middleware);
        self
    }

    /// Use `registry` as the list of caller-supplied middlewares.
    #[must_use]
    pub fn with_middlewares(mut self, registry: MiddlewareRegistry) -> Self {
        self.middlewares = registry;
        self
    }

    /// Budget for steps that declare no timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = Some(millis(timeout));
        self
    }

    /// Budget for a whole run.
    #[must_use]
    pub fn with_pipeline_timeout(mut self, timeout: Duration) -> Self {
        self.config.pipeline_timeout_ms = Some(millis(timeout));
        self
    }

    /// Pause between attempts of the same step.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay_ms = millis(delay);
        self
    }

    /// Maximum `next_steps` nesting.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    /// Use a custom factory for the initial result.
    #[must_use]
    pub fn with_result_factory(mut self, factory: Arc<dyn StepResultFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Build the [`Pipeline`].
    pub fn build(self) -> Pipeline {
        Pipeline {
            config: self.config,
            middlewares: self.middlewares,
            factory: self.factory,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
