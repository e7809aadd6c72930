use crate::validator::ValidationIssue;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph failed validation with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is still active")]
    RunActive(String),

    #[error("Run {run_id} has no node awaiting approval{}", node_id.as_ref().map(|n| format!(" ({})", n)).unwrap_or_default())]
    NotAwaitingApproval {
        run_id: String,
        node_id: Option<String>,
    },

    #[error("Run {run_id} has several nodes awaiting approval ({}), name one", waiting.join(", "))]
    AmbiguousApproval {
        run_id: String,
        waiting: Vec<String>,
    },

    #[error("No executor registered for node type: {0}")]
    MissingExecutor(String),

    /// Engine-internal invariant violation. Fatal to the run.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node type already registered: {0}")]
    DuplicateType(String),

    #[error("Unknown node type: {0}")]
    UnknownType(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Unknown node type: {0}")]
    UnknownType(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node id already in use: {0}")]
    DuplicateNode(String),

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Edge id already in use: {0}")]
    DuplicateEdgeId(String),

    #[error("Edge {from_node}.{from_port} -> {to_node}.{to_port} already exists")]
    DuplicateEdge {
        from_node: String,
        from_port: String,
        to_node: String,
        to_port: String,
    },

    #[error("Port '{port}' not found on node '{node}'")]
    PortNotFound { node: String, port: String },

    #[error("Port '{port}' on node '{node}' is an {actual} port, expected {expected}")]
    DirectionMismatch {
        node: String,
        port: String,
        expected: String,
        actual: String,
    },

    #[error("Cannot connect {from_type} output to {to_type} input ({from_node}.{from_port} -> {to_node}.{to_port})")]
    TypeMismatch {
        from_node: String,
        from_port: String,
        from_type: String,
        to_node: String,
        to_port: String,
        to_type: String,
    },

    #[error("Node '{0}' cannot be connected to itself")]
    SelfLoop(String),

    #[error("Unknown config option '{option}' for node type '{node_type}'")]
    UnknownConfigOption { node_type: String, option: String },

    #[error("Config option '{option}' expects {expected}, got {actual}")]
    ConfigTypeMismatch {
        option: String,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    /// `committed` is set when an irreversible external effect already happened.
    #[error("Cancelled{}", if *committed { " after committing an external effect" } else { "" })]
    Cancelled { committed: bool },

    #[error("Circuit open for node '{0}'")]
    CircuitOpen(String),

    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<NodeError> },
}

impl NodeError {
    pub fn execution(message: impl Into<String>) -> Self {
        NodeError::Execution(message.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, NodeError::Cancelled { .. })
    }

    /// Number of executor invocations this error accounts for.
    pub fn attempts(&self) -> u32 {
        match self {
            NodeError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}
