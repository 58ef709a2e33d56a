//! # step-pipeline
//!
//! Async orchestration of multi-step LLM pipelines in Rust.
//!
//! A pipeline is an ordered list of steps. Each step gets the previous step's
//! result, runs through a middleware chain that adds tracing, a time budget
//! and a retry loop with feedback, and may ask for more steps to run right
//! away. Results are memoized per path within a run.
//!
//! ## Core Concepts
//!
//! - **Step**: The unit of work, over dynamic `serde_json::Value` payloads
//! - **StepResult**: A value, an optional error, and optional `next_steps`
//! - **PipelineContext**: Per-run cache, metadata, conversation and metrics
//! - **Middleware**: Composable wrappers around every step execution
//! - **GroupStep**: Sequential children at the parent's path
//! - **ParallelStep**: Concurrent branches with isolated conversations
//! - **SwitchStep**: Run-time routing to one successor
//! - **TypedStep**: Transform steps over concrete serde types
//! - **StepRegistry**: Steps built from JSON configuration
//! - **Pipeline**: Entry checks, the executor and run-level metrics
//!
//! ## Example: Routing with Metrics
//!
//! ```rust
//! use std::sync::Arc;
//! use step_pipeline::{LambdaStep, NoopStep, Pipeline, PipelineContext, Route, Step, SwitchStep};
//! use serde_json::{json, Value};
//!
//! # tokio_test::block_on(async {
//! let shout: Arc<dyn Step> = Arc::new(LambdaStep::new("Shout", |v: Value| async move {
//!     Ok::<Value, step_pipeline::Error>(json!(v.as_str().unwrap_or_default().to_uppercase()))
//! }));
//! let router = SwitchStep::new("Router", move |value: &Value, _ctx: &PipelineContext| {
//!     let target: Arc<dyn Step> = if value.is_string() {
//!         shout.clone()
//!     } else {
//!         Arc::new(NoopStep::new("Keep"))
//!     };
//!     Some(Route::new(target, value.clone()))
//! });
//!
//! let steps: Vec<Arc<dyn Step>> = vec![Arc::new(router)];
//! let (result, metrics) = Pipeline::new().run(&steps, "hello".to_string()).await.unwrap();
//!
//! assert_eq!(result.value(), &json!("HELLO"));
//! assert_eq!(metrics.steps_completed, 2);
//! # });
//! ```

pub mod cancel;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod events;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod step;
pub mod tag;

pub use cancel::CancelSignal;
pub use config::{PipelineConfig, DEFAULT_MAX_DEPTH};
pub use context::{PipelineContext, PATH_SEPARATOR};
pub use conversation::{Conversation, Message, Role};
pub use error::{Error, Result};
pub use events::{EventSink, NullSink, PipelineEvent, RecordingSink, Tags, TraceEntry};
pub use metrics::{DurationStats, PipelineMetrics};
pub use middleware::{Middleware, MiddlewareChain, MiddlewareRegistry, Next};
pub use pipeline::{Executor, Pipeline, PipelineBuilder};
pub use registry::{StepConfig, StepRegistry};
pub use result::{DefaultResultFactory, StepError, StepErrorKind, StepResult, StepResultFactory};
pub use tag::TypeTag;

// Re-export step types
pub use step::{Attempt, LambdaStep, Step, Validation, DEFAULT_MAX_RETRIES};
pub use step::action::ActionStep;
pub use step::group::GroupStep;
pub use step::noop::NoopStep;
pub use step::parallel::ParallelStep;
pub use step::switch::{Route, SwitchBuilder, SwitchStep};
pub use step::typed::{Typed, TypedStep};
