//! Middleware wrapped around every step execution.
//!
//! A run composes its middlewares into one [`MiddlewareChain`]:
//!
//! ```text
//! [registered middlewares, in order] -> Observability -> Timeout -> Retry -> Step::execute
//! ```
//!
//! Registered middlewares see the raw call first and the final result last.
//! [`ObservabilityMiddleware`] covers every attempt of a step,
//! [`TimeoutMiddleware`] installs one budget shared by all attempts, and
//! [`RetryMiddleware`] owns the attempt loop and calls the step directly.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::{CancelSignal, Error, PipelineContext, Result, Step, StepResult};

pub mod observability;
pub mod retry;
pub mod timeout;

pub use observability::ObservabilityMiddleware;
pub use retry::RetryMiddleware;
pub use timeout::TimeoutMiddleware;

/// A composable wrapper around step execution.
///
/// Middlewares are shared by every step and every run, so they keep no
/// per-call state. An implementation either calls `next` exactly once or
/// returns its own result without calling it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use step_pipeline::{CancelSignal, PipelineContext, Result, Step, StepResult};
/// use step_pipeline::middleware::{Middleware, Next};
///
/// struct TagTenant;
///
/// #[async_trait]
/// impl Middleware for TagTenant {
///     async fn invoke(
///         &self,
///         step: &Arc<dyn Step>,
///         input: &StepResult,
///         ctx: &PipelineContext,
///         next: Next<'_>,
///         cancel: &CancelSignal,
///     ) -> Result<StepResult> {
///         ctx.set_metadata("last_step", step.name().into());
///         next.run(step, input, ctx, cancel).await
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one step execution.
    async fn invoke(
        &self,
        step: &Arc<dyn Step>,
        input: &StepResult,
        ctx: &PipelineContext,
        next: Next<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult>;
}

/// The remainder of a middleware chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Continue with the next middleware.
    pub fn run(
        self,
        step: &'a Arc<dyn Step>,
        input: &'a StepResult,
        ctx: &'a PipelineContext,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<StepResult>> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware.invoke(step, input, ctx, Next { rest }, cancel)
            }
            None => Box::pin(async move {
                Err(Error::Configuration(format!(
                    "middleware chain for step '{}' ended without executing it",
                    step.name()
                )))
            }),
        }
    }
}

/// An ordered list of caller-supplied middlewares.
///
/// The list is handed to a [`Pipeline`](crate::Pipeline) when it is built and
/// applies to every run of that pipeline, ahead of the built-in middlewares.
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Append several middlewares, keeping their order.
    pub fn register_all(&mut self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        self.middlewares.extend(middlewares);
    }

    /// Registered middlewares in order.
    pub fn list(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Remove every middleware.
    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// The composed middleware delegate for one run.
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Compose `registered` with the built-in middlewares.
    pub fn new(
        registered: &MiddlewareRegistry,
        default_timeout: Option<Duration>,
        retry_delay: Duration,
    ) -> Self {
        let mut layers = registered.list().to_vec();
        layers.push(Arc::new(ObservabilityMiddleware));
        layers.push(Arc::new(TimeoutMiddleware::new(default_timeout)));
        layers.push(Arc::new(RetryMiddleware::new(retry_delay)));
        Self { layers }
    }

    /// Run `step` through every layer.
    pub fn invoke<'a>(
        &'a self,
        step: &'a Arc<dyn Step>,
        input: &'a StepResult,
        ctx: &'a PipelineContext,
        cancel: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Next { rest: &self.layers }.run(step, input, ctx, cancel)
    }

    /// Layer names from outermost to innermost.
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|m| m.name()).collect()
    }
}
