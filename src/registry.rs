//! Building steps from configuration records.
//!
//! A [`StepRegistry`] maps a `kind` string to a factory. Factories receive the
//! registry itself so container kinds can build their children.
//!
//! ```rust
//! use step_pipeline::{Step, StepConfig, StepRegistry};
//!
//! let config: StepConfig = serde_json::from_str(r#"{
//!     "kind": "group",
//!     "name": "Prepare",
//!     "children": [
//!         { "kind": "noop", "name": "Load" },
//!         { "kind": "noop", "name": "Clean" }
//!     ]
//! }"#).unwrap();
//!
//! let step = StepRegistry::new().build(&config).unwrap();
//! assert_eq!(step.name(), "Prepare");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, GroupStep, NoopStep, ParallelStep, Result, Step};

/// A declarative description of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Registered factory to build with.
    pub kind: String,
    /// Name of the built step.
    pub name: String,
    /// Factory-specific settings.
    #[serde(default)]
    pub params: Value,
    /// Child steps for container kinds.
    #[serde(default, alias = "steps", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepConfig>,
}

impl StepConfig {
    /// A config with no params or children.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            params: Value::Null,
            children: Vec::new(),
        }
    }

    /// Add a child.
    #[must_use]
    pub fn with_child(mut self, child: StepConfig) -> Self {
        self.children.push(child);
        self
    }

    /// Set the params.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

type Factory = dyn Fn(&StepConfig, &StepRegistry) -> Result<Arc<dyn Step>> + Send + Sync;

/// Named step factories.
///
/// A new registry knows the built-in kinds `noop`, `group` and `parallel`.
#[derive(Clone)]
pub struct StepRegistry {
    factories: BTreeMap<String, Arc<Factory>>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    /// A registry with the built-in kinds.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("noop", |config: &StepConfig, _: &StepRegistry| {
            Ok(Arc::new(NoopStep::new(config.name.clone())) as Arc<dyn Step>)
        });
        registry.register("group", |config: &StepConfig, registry: &StepRegistry| {
            let children = registry.build_all(&config.children)?;
            Ok(Arc::new(GroupStep::from_steps(config.name.clone(), children)) as Arc<dyn Step>)
        });
        registry.register("parallel", |config: &StepConfig, registry: &StepRegistry| {
            let branches = registry.build_all(&config.children)?;
            Ok(Arc::new(ParallelStep::from_steps(config.name.clone(), branches)) as Arc<dyn Step>)
        });
        registry
    }

    /// A registry with no kinds at all.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register `factory` under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&StepConfig, &StepRegistry) -> Result<Arc<dyn Step>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Build one step.
    pub fn build(&self, config: &StepConfig) -> Result<Arc<dyn Step>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            Error::Configuration(format!(
                "unknown step kind '{}' for step '{}'",
                config.kind, config.name
            ))
        })?;
        factory(config, self)
    }

    /// Build a list of steps, stopping at the first failure.
    pub fn build_all(&self, configs: &[StepConfig]) -> Result<Vec<Arc<dyn Step>>> {
        configs.iter().map(|config| self.build(config)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CancelSignal, LambdaStep, Pipeline, PipelineContext};
    use serde_json::json;

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = StepRegistry::new();
        for kind in ["group", "noop", "parallel"] {
            assert!(registry.build(&StepConfig::new(kind, "Built")).is_ok());
        }
        assert!(StepRegistry::empty().build(&StepConfig::new("noop", "Built")).is_err());
    }

    #[test]
    fn unknown_kind_is_a_configuration_error() {
        let outcome = StepRegistry::new().build(&StepConfig::new("llm", "Summarize"));
        assert!(matches!(outcome, Err(Error::Configuration(_))));
    }

    #[test]
    fn steps_alias_is_accepted() {
        let config: StepConfig = serde_json::from_value(json!({
            "kind": "parallel",
            "name": "Fanout",
            "steps": [{ "kind": "noop", "name": "A" }]
        }))
        .unwrap();
        assert_eq!(config.children.len(), 1);
        assert_eq!(config.params, Value::Null);
    }

    #[tokio::test]
    async fn custom_kinds_read_their_params() {
        let mut registry = StepRegistry::new();
        registry.register("add", |config: &StepConfig, _: &StepRegistry| {
            let amount = config.params["amount"].as_i64().ok_or_else(|| {
                Error::Configuration(format!("step '{}' needs an integer amount", config.name))
            })?;
            Ok(Arc::new(LambdaStep::new(config.name.clone(), move |v: Value| async move {
                Ok::<Value, Error>(json!(v.as_i64().unwrap_or_default() + amount))
            })) as Arc<dyn Step>)
        });

        let config = StepConfig::new("group", "Math")
            .with_child(StepConfig::new("add", "AddOne").with_params(json!({"amount": 1})))
            .with_child(StepConfig::new("add", "AddTwo").with_params(json!({"amount": 2})));
        let steps = vec![registry.build(&config).unwrap()];
        let mut ctx = PipelineContext::new();

        let result = Pipeline::new()
            .run_with_ctx(&mut ctx, &steps, 10, &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(result.value(), &json!(13));
        assert_eq!(ctx.result_keys(), ["AddOne", "AddTwo", "Math"]);
        assert!(registry
            .build(&StepConfig::new("add", "Broken"))
            .is_err());
    }
}
