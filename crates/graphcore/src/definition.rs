//! Node definitions: port contracts, config schema and the closed set of built-in kinds.

use crate::error::GraphError;
use crate::value::{Config, ConfigType, DataType, Value, ValueExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Config option accepted by every node kind: per-invocation timeout in milliseconds.
pub const TIMEOUT_OPTION: &str = "timeoutMs";

/// Output port name that receives the error payload when a node fails.
pub const ERROR_PORT: &str = "error";

/// Well-known categories of the built-in catalog
pub mod category {
    pub const IO: &str = "io";
    pub const AGENTS: &str = "agents";
    pub const CONTROL: &str = "control";
    pub const DATA: &str = "data";
    pub const MEMORY: &str = "memory";
    pub const INTEGRATION: &str = "integration";
    pub const GOVERNANCE: &str = "governance";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// How many edges an input port accepts and when it counts as bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FanIn {
    /// Exactly one incoming edge
    #[default]
    Single,
    /// Any number of edges; bound once every one of them delivered (join)
    All,
    /// Any number of edges; bound once all resolved and at least one delivered (merge)
    Any,
}

impl FanIn {
    pub fn accepts_many(self) -> bool {
        !matches!(self, FanIn::Single)
    }
}

/// A named, typed slot on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub data_type: DataType,
    /// Only meaningful for inputs
    pub required: bool,
    /// Only meaningful for inputs
    pub fan_in: FanIn,
}

impl Port {
    pub fn input(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            data_type,
            required: false,
            fan_in: FanIn::Single,
        }
    }

    pub fn output(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            data_type,
            required: false,
            fan_in: FanIn::Single,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_fan_in(mut self, fan_in: FanIn) -> Self {
        self.fan_in = fan_in;
        self
    }
}

/// Schema entry for one config option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(rename = "type")]
    pub option_type: ConfigType,
    #[serde(default)]
    pub default: Value,
}

/// Immutable description of a node kind, registered once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DefinitionShape", into = "DefinitionShape")]
pub struct NodeDefinition {
    pub node_type: String,
    pub category: String,
    pub description: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub config_schema: BTreeMap<String, ConfigOption>,
    /// Any output port name is accepted (typed `any`), e.g. switch labels
    pub dynamic_outputs: bool,
    /// May be connected to itself
    pub feedback_capable: bool,
}

impl NodeDefinition {
    pub fn new(node_type: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            category: category.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            config_schema: BTreeMap::new(),
            dynamic_outputs: false,
            feedback_capable: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, port: Port) -> Self {
        self.inputs.push(Port {
            direction: PortDirection::Input,
            ..port
        });
        self
    }

    pub fn with_output(mut self, port: Port) -> Self {
        self.outputs.push(Port {
            direction: PortDirection::Output,
            required: false,
            fan_in: FanIn::Single,
            ..port
        });
        self
    }

    pub fn with_option(
        mut self,
        name: impl Into<String>,
        option_type: ConfigType,
        default: Value,
    ) -> Self {
        self.config_schema.insert(
            name.into(),
            ConfigOption {
                option_type,
                default,
            },
        );
        self
    }

    pub fn with_dynamic_outputs(mut self) -> Self {
        self.dynamic_outputs = true;
        self
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_type(&self.node_type)
    }

    pub fn input(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Declared output port, or a synthesized `any` port for dynamic-output kinds
    pub fn output(&self, name: &str) -> Option<Port> {
        self.outputs
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .or_else(|| {
                (self.dynamic_outputs && self.input(name).is_none())
                    .then(|| Port::output(name, DataType::Any))
            })
    }

    pub fn has_error_port(&self) -> bool {
        self.outputs.iter().any(|p| p.name == ERROR_PORT)
    }

    /// Config populated from schema defaults
    pub fn defaults(&self) -> Config {
        self.config_schema
            .iter()
            .filter(|(_, option)| !option.default.is_null())
            .map(|(name, option)| (name.clone(), option.default.clone()))
            .collect()
    }

    /// Schema defaults overlaid with the explicit config
    pub fn effective_config(&self, config: &Config) -> Config {
        let mut merged = self.defaults();
        for (key, value) in config {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Check one config value against the schema. `null` is always accepted (reset).
    pub fn check_option(&self, name: &str, value: &Value) -> Result<(), GraphError> {
        if value.is_null() {
            return Ok(());
        }
        let expected = if name == TIMEOUT_OPTION {
            ConfigType::Number
        } else {
            self.config_schema
                .get(name)
                .map(|option| option.option_type)
                .ok_or_else(|| GraphError::UnknownConfigOption {
                    node_type: self.node_type.clone(),
                    option: name.to_string(),
                })?
        };
        if expected.accepts(value) {
            Ok(())
        } else {
            Err(GraphError::ConfigTypeMismatch {
                option: name.to_string(),
                expected: expected.as_str().to_string(),
                actual: value.type_name().to_string(),
            })
        }
    }
}

impl fmt::Display for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_type, self.category)
    }
}

/// Registration shape exchanged with external catalogs
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionShape {
    #[serde(rename = "type")]
    node_type: String,
    category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default)]
    inputs: Vec<PortShape>,
    #[serde(default)]
    outputs: Vec<PortShape>,
    #[serde(default)]
    config_schema: BTreeMap<String, ConfigOption>,
    #[serde(default, skip_serializing_if = "is_false")]
    dynamic_outputs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    feedback_capable: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortShape {
    name: String,
    #[serde(default)]
    data_type: DataType,
    #[serde(default, skip_serializing_if = "is_false")]
    required: bool,
    #[serde(default, skip_serializing_if = "is_single")]
    fan_in: FanIn,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_single(fan_in: &FanIn) -> bool {
    *fan_in == FanIn::Single
}

impl PortShape {
    fn into_port(self, direction: PortDirection) -> Port {
        let is_input = direction == PortDirection::Input;
        Port {
            name: self.name,
            direction,
            data_type: self.data_type,
            required: is_input && self.required,
            fan_in: if is_input { self.fan_in } else { FanIn::Single },
        }
    }
}

impl From<Port> for PortShape {
    fn from(port: Port) -> Self {
        Self {
            name: port.name,
            data_type: port.data_type,
            required: port.required,
            fan_in: port.fan_in,
        }
    }
}

impl From<DefinitionShape> for NodeDefinition {
    fn from(shape: DefinitionShape) -> Self {
        Self {
            node_type: shape.node_type,
            category: shape.category,
            description: shape.description,
            inputs: shape
                .inputs
                .into_iter()
                .map(|p| p.into_port(PortDirection::Input))
                .collect(),
            outputs: shape
                .outputs
                .into_iter()
                .map(|p| p.into_port(PortDirection::Output))
                .collect(),
            config_schema: shape.config_schema,
            dynamic_outputs: shape.dynamic_outputs,
            feedback_capable: shape.feedback_capable,
        }
    }
}

impl From<NodeDefinition> for DefinitionShape {
    fn from(def: NodeDefinition) -> Self {
        Self {
            node_type: def.node_type,
            category: def.category,
            description: def.description,
            inputs: def.inputs.into_iter().map(PortShape::from).collect(),
            outputs: def.outputs.into_iter().map(PortShape::from).collect(),
            config_schema: def.config_schema,
            dynamic_outputs: def.dynamic_outputs,
            feedback_capable: def.feedback_capable,
        }
    }
}

macro_rules! node_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Closed set of built-in node kinds
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NodeKind {
            $($variant),+
        }

        impl NodeKind {
            pub const ALL: &'static [NodeKind] = &[$(NodeKind::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(NodeKind::$variant => $name),+
                }
            }

            pub fn from_type(node_type: &str) -> Option<Self> {
                match node_type {
                    $($name => Some(NodeKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

node_kinds! {
    Input => "input",
    Output => "output",
    Agent => "agent",
    Team => "team",
    Tool => "tool",
    Condition => "condition",
    Switch => "switch",
    Loop => "loop",
    Parallel => "parallel",
    Join => "join",
    Delay => "delay",
    Retry => "retry",
    CircuitBreaker => "circuit-breaker",
    RateLimiter => "rate-limiter",
    Transform => "transform",
    Map => "map",
    Filter => "filter",
    Merge => "merge",
    Split => "split",
    Cache => "cache",
    Template => "template",
    JsonParse => "json-parse",
    JsonStringify => "json-stringify",
    MemoryRead => "memory-read",
    MemoryWrite => "memory-write",
    RagSearch => "rag-search",
    Http => "http",
    Webhook => "webhook",
    Database => "database",
    Integration => "integration",
    HumanApproval => "human-approval",
    AuditLog => "audit-log",
    SecretFetch => "secret-fetch",
    CostGuard => "cost-guard",
    PiiDetection => "pii-detection",
}

impl NodeKind {
    /// Kinds whose executors only coordinate other work and never occupy a worker slot
    pub fn is_coordinator(self) -> bool {
        matches!(self, NodeKind::Loop | NodeKind::HumanApproval)
    }

    /// Branching kinds that activate a subset of their output ports
    pub fn is_branching(self) -> bool {
        matches!(
            self,
            NodeKind::Condition | NodeKind::Switch | NodeKind::CircuitBreaker | NodeKind::HumanApproval
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
