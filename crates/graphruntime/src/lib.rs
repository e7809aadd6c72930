//! Graph execution runtime
//!
//! This crate provides the execution engine that runs graphs: executor
//! registration, per-run scheduling of ready nodes, loop bodies, approvals,
//! cancellation and the run records exposed to callers.

mod approval;
mod context;
mod executor;
mod frame;
mod plan;
mod registry;
mod runtime;

pub use context::{RunRecord, RuntimeContext, RuntimeState};
pub use executor::{ExecutionEngine, Run};
pub use registry::{ExecutorFactory, ExecutorRegistry};
pub use runtime::{GraphRuntime, RuntimeConfig};
