//! Typed transform steps over serde types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::{settle, Attempt, Validation, DEFAULT_MAX_RETRIES};
use crate::{CancelSignal, Error, PipelineContext, Result, Step, StepResult, TypeTag};

/// A step whose input and output are concrete Rust types.
///
/// Wrap it in [`Typed`] (or call [`into_step`](TypedStep::into_step)) to put it
/// in a pipeline. The declared type tags come from `Input` and `Output`, so the
/// pipeline rejects an initial value of the wrong type, and every result is
/// checked to deserialize as `Output` before [`check`](TypedStep::check) runs.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use step_pipeline::{Attempt, CancelSignal, PipelineContext, Result, Step, TypedStep};
///
/// struct WordCount;
///
/// #[async_trait]
/// impl TypedStep for WordCount {
///     type Input = String;
///     type Output = usize;
///
///     fn name(&self) -> &str {
///         "WordCount"
///     }
///
///     async fn transform(
///         &self,
///         input: String,
///         _ctx: &PipelineContext,
///         _attempt: Attempt<'_>,
///         _cancel: &CancelSignal,
///     ) -> Result<usize> {
///         Ok(input.split_whitespace().count())
///     }
/// }
///
/// let step = WordCount.into_step();
/// assert_eq!(step.input_type().name(), "alloc::string::String");
/// ```
#[async_trait]
pub trait TypedStep: Send + Sync {
    /// The input type for this step.
    type Input: DeserializeOwned + Send + 'static;
    /// The output type produced by this step.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Name of the step.
    fn name(&self) -> &str;

    /// Total number of attempts for this step.
    fn max_retries(&self) -> u32 {
        DEFAULT_MAX_RETRIES
    }

    /// Time budget for this step across all of its attempts.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Produce the output. Return [`Error::Recoverable`] to ask for another attempt.
    async fn transform(
        &self,
        input: Self::Input,
        ctx: &PipelineContext,
        attempt: Attempt<'_>,
        cancel: &CancelSignal,
    ) -> Result<Self::Output>;

    /// Semantic validation of the output.
    async fn check(&self, _output: &Self::Output, _ctx: &PipelineContext) -> Validation {
        Validation::Valid
    }

    /// Erase the type behind the dynamic [`Step`] contract.
    fn into_step(self) -> Arc<dyn Step>
    where
        Self: Sized + 'static,
    {
        Arc::new(Typed::new(self))
    }
}

/// Adapter running a [`TypedStep`] as a [`Step`].
pub struct Typed<S> {
    inner: S,
}

impl<S: TypedStep> Typed<S> {
    /// Wrap a typed step.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Access the inner step.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: TypedStep> Step for Typed<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<S::Input>()
    }

    fn output_type(&self) -> TypeTag {
        TypeTag::of::<S::Output>()
    }

    fn max_retries(&self) -> u32 {
        self.inner.max_retries()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    async fn execute(
        &self,
        input: &StepResult,
        ctx: &PipelineContext,
        attempt: Attempt<'_>,
        cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let typed_input = input.value_as::<S::Input>().map_err(|e| {
            Error::Configuration(format!(
                "step '{}' cannot read its input as {}: {e}",
                self.name(),
                TypeTag::of::<S::Input>()
            ))
        })?;
        let outcome = match self.inner.transform(typed_input, ctx, attempt, cancel).await {
            Ok(output) => StepResult::from_serializable(&output),
            Err(e) => Err(e),
        };
        settle(outcome)
    }

    async fn validate(
        &self,
        result: &StepResult,
        ctx: &PipelineContext,
        _cancel: &CancelSignal,
    ) -> Validation {
        match result.value_as::<S::Output>() {
            Ok(output) => self.inner.check(&output, ctx).await,
            Err(e) => Validation::invalid(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Summary {
        text: String,
    }

    struct Summarize;

    #[async_trait]
    impl TypedStep for Summarize {
        type Input = String;
        type Output = Summary;

        fn name(&self) -> &str {
            "Summarize"
        }

        async fn transform(
            &self,
            input: String,
            _ctx: &PipelineContext,
            attempt: Attempt<'_>,
            _cancel: &CancelSignal,
        ) -> Result<Summary> {
            if attempt.number == 1 {
                return Err(Error::Recoverable("first draft rejected".into()));
            }
            Ok(Summary {
                text: input.chars().take(5).collect(),
            })
        }

        async fn check(&self, output: &Summary, _ctx: &PipelineContext) -> Validation {
            if output.text.is_empty() {
                Validation::invalid("summary is empty")
            } else {
                Validation::Valid
            }
        }
    }

    #[tokio::test]
    async fn transforms_through_json() {
        let step = Typed::new(Summarize);
        let ctx = PipelineContext::new();
        let input = StepResult::new(json!("a long article"));

        let first = step
            .execute(&input, &ctx, Attempt::FIRST, &CancelSignal::new())
            .await
            .unwrap();
        assert!(first.has_error() && !first.is_fatal());

        let second = step
            .execute(
                &input,
                &ctx,
                Attempt {
                    number: 2,
                    previous: Some(&first),
                },
                &CancelSignal::new(),
            )
            .await
            .unwrap();
        assert_eq!(second.value_as::<Summary>().unwrap().text, "a lon");
    }

    #[tokio::test]
    async fn wrong_input_shape_is_a_fault() {
        let step = Typed::new(Summarize);
        let outcome = step
            .execute(
                &StepResult::new(json!(42)),
                &PipelineContext::new(),
                Attempt::FIRST,
                &CancelSignal::new(),
            )
            .await;
        assert!(matches!(outcome, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn validate_runs_the_typed_check() {
        let step = Typed::new(Summarize);
        let ctx = PipelineContext::new();
        let cancel = CancelSignal::new();

        let empty = StepResult::new(json!({"text": ""}));
        assert_eq!(
            step.validate(&empty, &ctx, &cancel).await,
            Validation::invalid("summary is empty")
        );
        let malformed = StepResult::new(json!({"body": "x"}));
        assert!(!step.validate(&malformed, &ctx, &cancel).await.is_valid());
    }
}
