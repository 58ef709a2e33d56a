//! Core step trait and fundamental step types.
//!
//! This module defines the [`Step`] trait, the unit of work every pipeline is
//! built from, along with [`LambdaStep`] for closure-based steps. The
//! submodules hold the typed adapter and the structural steps that shape
//! control flow: grouping, parallel branches and routing.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::events::Tags;
use crate::{CancelSignal, Error, PipelineContext, Result, StepError, StepResult, TypeTag};

pub mod action;
pub mod group;
pub mod noop;
pub mod parallel;
pub mod switch;
pub mod typed;

/// Attempts a step gets unless it says otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Which attempt is running, and what the previous one produced.
///
/// `previous` is the exact result of the last failed attempt, so a step can
/// show its own mistake to a model and ask for a correction.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    /// One-based attempt number.
    pub number: u32,
    /// Result of the previous attempt, if this is a retry.
    pub previous: Option<&'a StepResult>,
}

impl Attempt<'static> {
    /// The first attempt.
    pub const FIRST: Self = Attempt {
        number: 1,
        previous: None,
    };
}

impl Attempt<'_> {
    /// Returns true if an earlier attempt failed.
    pub fn is_retry(&self) -> bool {
        self.previous.is_some()
    }
}

/// Outcome of a step's own validation of its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The result is acceptable.
    Valid,
    /// The result is rejected; the message is fed back to the next attempt.
    Invalid(String),
}

impl Validation {
    /// Reject with `message`.
    pub fn invalid(message: impl Into<String>) -> Self {
        Validation::Invalid(message.into())
    }

    /// Returns true for [`Validation::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

impl From<std::result::Result<(), String>> for Validation {
    fn from(result: std::result::Result<(), String>) -> Self {
        match result {
            Ok(()) => Validation::Valid,
            Err(message) => Validation::Invalid(message),
        }
    }
}

/// The unit of pipeline work.
///
/// A step is constructed once and reused across runs, possibly concurrently,
/// so it keeps no per-run state. Everything a run needs arrives through the
/// arguments of [`execute`](Step::execute).
///
/// Returning `Err` from `execute` is a fault: the step is not retried and the
/// run stops. To ask for another attempt, return a result carrying a
/// fault-free error such as [`StepResult::failed`].
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use step_pipeline::{Attempt, CancelSignal, PipelineContext, Result, Step, StepResult};
///
/// struct Shout;
///
/// #[async_trait]
/// impl Step for Shout {
///     fn name(&self) -> &str {
///         "Shout"
///     }
///
///     async fn execute(
///         &self,
///         input: &StepResult,
///         _ctx: &PipelineContext,
///         _attempt: Attempt<'_>,
///         _cancel: &CancelSignal,
///     ) -> Result<StepResult> {
///         let text = input.value().as_str().unwrap_or_default().to_uppercase();
///         Ok(StepResult::new(text.into()))
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Name of the step, unique within its path scope. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Declared input type.
    fn input_type(&self) -> TypeTag {
        TypeTag::any()
    }

    /// Declared output type, used for structural validation of results.
    fn output_type(&self) -> TypeTag {
        TypeTag::any()
    }

    /// Total number of attempts for this step.
    fn max_retries(&self) -> u32 {
        DEFAULT_MAX_RETRIES
    }

    /// Time budget for this step across all of its attempts.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether this step's `next_steps` run at the current path instead of
    /// one level below it.
    fn is_transparent(&self) -> bool {
        false
    }

    /// Run one attempt.
    async fn execute(
        &self,
        input: &StepResult,
        ctx: &PipelineContext,
        attempt: Attempt<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult>;

    /// Semantic validation of an error-free result.
    async fn validate(
        &self,
        _result: &StepResult,
        _ctx: &PipelineContext,
        _cancel: &CancelSignal,
    ) -> Validation {
        Validation::Valid
    }

    /// Called once with the final result of a step execution.
    async fn finalize(&self, _result: &StepResult, _ctx: &PipelineContext, _cancel: &CancelSignal) {
    }

    /// Attach tags to the step's span and started event.
    fn enrich_started(&self, _input: &StepResult, _tags: &mut Tags) {}

    /// Attach tags to the step's completed event.
    fn enrich_completed(&self, _result: &StepResult, _tags: &mut Tags) {}
}

/// Turn a step body's outcome into a result: recoverable errors become
/// fault-free error results, anything else stays a fault.
pub(crate) fn settle(outcome: Result<StepResult>) -> Result<StepResult> {
    match outcome {
        Err(Error::Validation(message)) => {
            Ok(StepResult::new(Value::Null).with_error(StepError::validation(message)))
        }
        Err(e) if e.is_recoverable() => Ok(StepResult::failed(e.to_string())),
        other => other,
    }
}

/// A step constructed from a closure over the input value.
///
/// Returning [`Error::Recoverable`](crate::Error::Recoverable) from the closure asks for another attempt;
/// any other error is fatal.
///
/// # Example
///
/// ```rust
/// use step_pipeline::LambdaStep;
/// use serde_json::{json, Value};
///
/// let double = LambdaStep::new("Double", |x: Value| async move {
///     Ok::<Value, step_pipeline::Error>(json!(x.as_i64().unwrap_or_default() * 2))
/// });
/// ```
pub struct LambdaStep<F> {
    name: String,
    f: F,
    max_retries: u32,
    timeout: Option<Duration>,
}

impl<F, Fut> LambdaStep<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    /// Create a new `LambdaStep` from the given closure.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
        }
    }

    /// Set the number of attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the time budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut> Step for LambdaStep<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        input: &StepResult,
        _ctx: &PipelineContext,
        _attempt: Attempt<'_>,
        _cancel: &CancelSignal,
    ) -> Result<StepResult> {
        settle((self.f)(input.value().clone()).await.map(StepResult::new))
    }
}
