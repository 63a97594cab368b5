//! Fan-out/fan-in execution: jobs, bounded executor, merge and orchestration.

pub mod engine;
pub mod executor;
pub mod invoker;
pub mod job;
pub mod merger;
mod metrics;

#[cfg(test)]
mod engine_integration_tests;

pub use engine::{Delivery, Engine, RunReport};
pub use executor::BoundedExecutor;
pub use invoker::{CommandTemplate, InvocationOutput, InvocationRequest, ProcessInvoker, ToolInvoker};
pub use job::{JobRunner, JobSettings, PartialResult};
pub use merger::{FailureEntry, MergedResult, ResultMerger, RunSummary};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
