//! Core abstractions for the workflow graph engine
//!
//! Node definitions and their registry, the graph model with its mutation
//! operations, the pre-run validator, the executor contract and run events.
//! There is no scheduler here; see `graphruntime`.

pub mod definition;
mod error;
pub mod events;
mod executor;
mod graph;
mod model;
mod registry;
mod state;
pub mod topology;
pub mod validator;
pub mod value;

pub use definition::{
    category, ConfigOption, FanIn, NodeDefinition, NodeKind, Port, PortDirection, ERROR_PORT,
    TIMEOUT_OPTION,
};
pub use error::{FlowError, GraphError, NodeError, RegistryError};
pub use events::*;
pub use executor::{
    ApprovalSignal, Decision, DetachedServices, Invocation, NodeContext, NodeExecutor,
    NodeMetrics, NodeOutput, RunServices,
};
pub use graph::{Edge, EdgeId, Endpoint, Graph, GraphNode, NodeId, PathKind};
pub use model::{disconnect_op, restore_config_op, GraphModel, GraphOp, RemovedNode};
pub use registry::NodeTypeRegistry;
pub use state::{NodeStatus, RunStatus, SkipReason};
pub use validator::{Severity, ValidationIssue};
pub use value::{Config, ConfigType, DataType, PortValues, Value, ValueExt};

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, FlowError>;
