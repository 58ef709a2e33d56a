//! Step results, step errors, and the factory that adapts raw values.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result, Step, TypeTag};

/// How a step error came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    /// A failure reported by the step itself, worth another attempt.
    Logical,
    /// The result was rejected by structural or semantic validation.
    Validation,
    /// The step's time budget ran out.
    Timeout,
    /// A fault: non-recoverable, stops the run.
    Fault,
}

/// The error half of a [`StepResult`].
///
/// An error with an attached fault is fatal and never retried. An error
/// without one is recoverable.
#[derive(Debug, Clone)]
pub struct StepError {
    message: String,
    kind: StepErrorKind,
    fault: Option<Arc<Error>>,
}

impl StepError {
    /// A recoverable failure reported by the step.
    pub fn logical(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Logical,
            fault: None,
        }
    }

    /// A recoverable validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Validation,
            fault: None,
        }
    }

    /// An expired time budget. Not a fault.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Timeout,
            fault: None,
        }
    }

    /// A fatal error carrying the original fault.
    pub fn fault(error: Error) -> Self {
        Self {
            message: error.to_string(),
            kind: StepErrorKind::Fault,
            fault: Some(Arc::new(error)),
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// What produced the error.
    pub fn kind(&self) -> StepErrorKind {
        self.kind
    }

    /// The original fault, if any.
    pub fn original(&self) -> Option<&Error> {
        self.fault.as_deref()
    }

    /// Returns true if the error carries a fault and must not be retried.
    pub fn is_fatal(&self) -> bool {
        self.fault.is_some()
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The outcome of one step execution attempt.
///
/// Besides its value and optional error, a result may ask the pipeline to run
/// more steps right away through [`next_steps`](StepResult::next_steps). Those
/// steps run before the producing step's original successors.
///
/// # Example
///
/// ```rust
/// use step_pipeline::StepResult;
/// use serde_json::json;
///
/// let ok = StepResult::new(json!({"summary": "short"}));
/// assert!(!ok.has_error());
///
/// let retry = StepResult::failed("summary was empty");
/// assert!(retry.has_error());
/// assert!(!retry.is_fatal());
/// ```
#[derive(Clone)]
pub struct StepResult {
    value: Value,
    error: Option<StepError>,
    step: Option<Arc<dyn Step>>,
    next_steps: Vec<Arc<dyn Step>>,
}

impl StepResult {
    /// A successful result carrying `value`.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            error: None,
            step: None,
            next_steps: Vec::new(),
        }
    }

    /// A successful result holding the JSON form of `value`.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// A recoverable failure. The step gets another attempt if it has any left.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Value::Null).with_error(StepError::logical(message))
    }

    /// A fatal failure carrying `error` as its fault.
    pub fn fatal(error: Error) -> Self {
        Self::new(Value::Null).with_error(StepError::fault(error))
    }

    /// Attach an error, keeping the value.
    #[must_use]
    pub fn with_error(mut self, error: StepError) -> Self {
        self.error = Some(error);
        self
    }

    /// Replace the follow-up steps.
    #[must_use]
    pub fn with_next_steps(mut self, steps: Vec<Arc<dyn Step>>) -> Self {
        self.next_steps = steps;
        self
    }

    /// Record the producing step.
    #[must_use]
    pub fn attributed_to(mut self, step: Arc<dyn Step>) -> Self {
        self.step = Some(step);
        self
    }

    /// The result value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the result, returning its value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Deserialize the value as `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.value)?)
    }

    /// The error, if any.
    pub fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    /// Returns true if this result carries an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns true if this result carries a fatal error.
    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(StepError::is_fatal)
    }

    /// Set or replace the error in place.
    pub fn set_error(&mut self, error: StepError) {
        self.error = Some(error);
    }

    /// The step that produced this result.
    pub fn step(&self) -> Option<&Arc<dyn Step>> {
        self.step.as_ref()
    }

    /// Name of the producing step, if known.
    pub fn step_name(&self) -> Option<&str> {
        self.step.as_ref().map(|s| s.name())
    }

    /// Steps to run immediately after this result.
    pub fn next_steps(&self) -> &[Arc<dyn Step>] {
        &self.next_steps
    }

    /// Queue a step to run immediately after this result.
    pub fn push_next(&mut self, step: Arc<dyn Step>) {
        self.next_steps.push(step);
    }

    /// Move the follow-up steps out, leaving the list empty.
    pub fn take_next_steps(&mut self) -> Vec<Arc<dyn Step>> {
        std::mem::take(&mut self.next_steps)
    }

    /// A new result with the same producer and `value`.
    ///
    /// The retry loop re-attributes every returned result to the step that
    /// ran, so a derived result is validated against that step's output type.
    pub fn derive(&self, value: Value) -> Self {
        Self {
            value,
            error: None,
            step: self.step.clone(),
            next_steps: Vec::new(),
        }
    }

    /// Structural validation: the value must fit the producer's output type.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.step {
            Some(step) => step.output_type().check(&self.value),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepResult")
            .field("value", &self.value)
            .field("error", &self.error)
            .field("step", &self.step_name())
            .field(
                "next_steps",
                &self.next_steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builds conforming results for a declared shape.
///
/// The pipeline uses a factory to adapt its raw initial value into the first
/// step's input.
pub trait StepResultFactory: Send + Sync {
    /// Build a result of `shape` produced by `step`.
    fn create(
        &self,
        shape: &TypeTag,
        step: Arc<dyn Step>,
        value: Option<Value>,
        error: Option<StepError>,
    ) -> Result<StepResult>;
}

/// Factory that checks the value against the shape and wraps it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResultFactory;

impl StepResultFactory for DefaultResultFactory {
    fn create(
        &self,
        shape: &TypeTag,
        step: Arc<dyn Step>,
        value: Option<Value>,
        error: Option<StepError>,
    ) -> Result<StepResult> {
        let value = value.unwrap_or(Value::Null);
        if error.is_none() {
            shape.check(&value).map_err(Error::Configuration)?;
        }
        let mut result = StepResult::new(value).attributed_to(step);
        if let Some(error) = error {
            result.set_error(error);
        }
        Ok(result)
    }
}
