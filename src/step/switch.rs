//! Routing steps that pick their successor at run time.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::events::PipelineEvent;
use crate::{Attempt, CancelSignal, Error, PipelineContext, Result, Step, StepResult};

/// The successor chosen by a [`SwitchStep`] and the value it returns.
pub struct Route {
    /// Step to run next, one level below the switch.
    pub target: Arc<dyn Step>,
    /// Value of the switch's own result, and so the target's input.
    pub value: Value,
}

impl Route {
    /// Route to `target` with `value`.
    pub fn new(target: Arc<dyn Step>, value: Value) -> Self {
        Self { target, value }
    }
}

type Decide = dyn Fn(&Value, &PipelineContext) -> Option<Route> + Send + Sync;

/// A step that routes to one successor based on the input value and context.
///
/// The decision runs once per execution and is never retried. Finding no
/// route is a configuration fault that stops the run.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use step_pipeline::{NoopStep, PipelineContext, Route, SwitchStep};
/// use serde_json::Value;
///
/// let router = SwitchStep::new("Router", |value: &Value, _ctx: &PipelineContext| {
///     let target = if value.is_string() { "Text" } else { "Other" };
///     Some(Route::new(Arc::new(NoopStep::new(target)), value.clone()))
/// });
/// ```
pub struct SwitchStep {
    name: String,
    decide: Box<Decide>,
}

impl SwitchStep {
    /// Create a switch from a decision function.
    pub fn new<F>(name: impl Into<String>, decide: F) -> Self
    where
        F: Fn(&Value, &PipelineContext) -> Option<Route> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            decide: Box::new(decide),
        }
    }

    /// Start a switch that routes on a string key computed from the input.
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use step_pipeline::{NoopStep, SwitchStep};
    ///
    /// let router = SwitchStep::by_key("Intent", |value, _ctx| {
    ///     value["intent"].as_str().map(str::to_string)
    /// })
    /// .case("refund", Arc::new(NoopStep::new("Refund")))
    /// .case("question", Arc::new(NoopStep::new("Answer")))
    /// .default(Arc::new(NoopStep::new("Escalate")))
    /// .build();
    /// ```
    pub fn by_key<K>(name: impl Into<String>, key: K) -> SwitchBuilder
    where
        K: Fn(&Value, &PipelineContext) -> Option<String> + Send + Sync + 'static,
    {
        SwitchBuilder {
            name: name.into(),
            key: Box::new(key),
            cases: HashMap::new(),
            default: None,
        }
    }
}

#[async_trait]
impl Step for SwitchStep {
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
        _cancel: &CancelSignal,
    ) -> Result<StepResult> {
        let Route { target, value } = (self.decide)(input.value(), ctx).ok_or_else(|| {
            Error::Configuration(format!("switch '{}' found no route", self.name))
        })?;

        debug!(step = %self.name, target = %target.name(), "route selected");
        ctx.emit(PipelineEvent::RouteSelected {
            step_name: self.name.clone(),
            target: target.name().to_string(),
        });
        Ok(StepResult::new(value).with_next_steps(vec![target]))
    }
}

type KeyFn = dyn Fn(&Value, &PipelineContext) -> Option<String> + Send + Sync;

/// Builder for a keyed [`SwitchStep`]. The input value is passed on unchanged.
pub struct SwitchBuilder {
    name: String,
    key: Box<KeyFn>,
    cases: HashMap<String, Arc<dyn Step>>,
    default: Option<Arc<dyn Step>>,
}

impl SwitchBuilder {
    /// Route `key` to `step`.
    #[must_use]
    pub fn case(mut self, key: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.cases.insert(key.into(), step);
        self
    }

    /// Route unmatched or missing keys to `step`.
    #[must_use]
    pub fn default(mut self, step: Arc<dyn Step>) -> Self {
        self.default = Some(step);
        self
    }

    /// Build the [`SwitchStep`].
    pub fn build(self) -> SwitchStep {
        let Self {
            name,
            key,
            cases,
            default,
        } = self;
        SwitchStep::new(name, move |value: &Value, ctx: &PipelineContext| {
            let target = key(value, ctx)
                .and_then(|k| cases.get(&k).cloned())
                .or_else(|| default.clone())?;
            Some(Route::new(target, value.clone()))
        })
    }
}
