use crate::events::{EventEmitter, RunId};
use crate::graph::{Edge, NodeId};
use crate::value::{Config, PortValues, Value};
use crate::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Strategy that performs one node kind's work
///
/// Executors never touch run state directly: whatever they return is published by the
/// engine. They must be safe to call again with the same inputs (retry and
/// circuit-breaker re-invoke them) and should return promptly once `ctx.cancellation`
/// fires.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node kind this executor implements (e.g. "delay", "http")
    fn node_type(&self) -> &str;

    /// Execute the node with resolved inputs
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: reject bad configuration when a run is submitted
    fn validate_config(&self, _config: &Config) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each invocation
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,

    pub node_id: NodeId,

    pub node_type: String,

    /// Values bound to input ports
    pub inputs: PortValues,

    /// Schema defaults overlaid with the node's config
    pub config: Config,

    /// Edges leaving this node, in graph order. Branching kinds read their conditions.
    pub outgoing: Vec<Edge>,

    /// Loop iteration when running inside a loop body
    pub iteration: Option<u32>,

    pub events: EventEmitter,

    /// Fires on run cancellation (or when this invocation times out)
    pub cancellation: CancellationToken,

    pub services: Arc<dyn RunServices>,
}

impl NodeContext {
    /// Standalone context, not attached to any run
    pub fn detached(node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            run_id: Uuid::nil(),
            events: EventEmitter::detached(node_id.clone()),
            node_id,
            node_type: node_type.into(),
            inputs: PortValues::new(),
            config: Config::new(),
            outgoing: Vec::new(),
            iteration: None,
            cancellation: CancellationToken::new(),
            services: Arc::new(DetachedServices),
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config
            .get(name)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or(default)
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(Value::as_str)
    }

    /// Non-negative integer option
    pub fn config_u64(&self, name: &str, default: u64) -> Result<u64, NodeError> {
        match self.config.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| {
                    NodeError::Configuration(format!("'{}' must be a non-negative number", name))
                }),
        }
    }

    /// Count option, saturating at `u32::MAX`
    pub fn config_u32(&self, name: &str, default: u32) -> Result<u32, NodeError> {
        let value = self.config_u64(name, u64::from(default))?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    }

    pub fn config_f64(&self, name: &str, default: f64) -> Result<f64, NodeError> {
        match self.config.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| NodeError::Configuration(format!("'{}' must be a number", name))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Values for the output ports that fired. Ports absent here are not taken.
    pub outputs: PortValues,

    pub metrics: NodeMetrics,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.custom.insert(key.into(), value.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.metrics.attempts = Some(attempts);
        self
    }
}

/// Metrics reported with an output. `duration_ms` is filled in by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub duration_ms: u64,
    /// Inner invocations made by wrapper kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Executor-specific counters (cost, usage, iterations, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
}

/// Engine services available to executors that coordinate other work
#[async_trait]
pub trait RunServices: Send + Sync {
    /// Invoke a node kind that is not itself part of the graph (the target of a wrapper)
    async fn invoke(&self, invocation: Invocation) -> Result<NodeOutput, NodeError>;

    /// Run one iteration of a loop node's body and return the iteration result
    async fn run_body(
        &self,
        loop_node: &str,
        item: Value,
        index: u32,
        cancellation: CancellationToken,
    ) -> Result<Value, NodeError>;

    /// Suspend until an approval signal is delivered for `node_id`
    async fn await_approval(&self, node_id: &str) -> Result<ApprovalSignal, NodeError>;
}

/// A wrapped call issued through [`RunServices::invoke`]
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Wrapper node on whose behalf the call is made
    pub caller: NodeId,
    pub node_type: String,
    pub config: Config,
    pub inputs: PortValues,
    pub cancellation: CancellationToken,
}

/// Services for executors running outside the engine
pub struct DetachedServices;

#[async_trait]
impl RunServices for DetachedServices {
    async fn invoke(&self, invocation: Invocation) -> Result<NodeOutput, NodeError> {
        Err(NodeError::execution(format!(
            "cannot invoke '{}' outside a run",
            invocation.node_type
        )))
    }

    async fn run_body(
        &self,
        loop_node: &str,
        _item: Value,
        _index: u32,
        _cancellation: CancellationToken,
    ) -> Result<Value, NodeError> {
        Err(NodeError::execution(format!(
            "loop '{}' has no body outside a run",
            loop_node
        )))
    }

    async fn await_approval(&self, node_id: &str) -> Result<ApprovalSignal, NodeError> {
        Err(NodeError::execution(format!(
            "no approvals can reach '{}' outside a run",
            node_id
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Decision::Approve),
            "reject" | "rejected" | "no" => Ok(Decision::Reject),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => f.write_str("approve"),
            Decision::Reject => f.write_str("reject"),
        }
    }
}

/// External signal delivered to a run waiting on human approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSignal {
    /// Target node; may be omitted when exactly one node is waiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalSignal {
    pub fn approve() -> Self {
        Self {
            node_id: None,
            decision: Decision::Approve,
            comment: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            decision: Decision::Reject,
            ..Self::approve()
        }
    }

    pub fn for_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
