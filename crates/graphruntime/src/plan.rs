use crate::registry::ExecutorRegistry;
use graphcore::topology::LoopScopes;
use graphcore::validator::{self, ValidationIssue};
use graphcore::{
    Config, Edge, FlowError, Graph, NodeDefinition, NodeExecutor, NodeId, NodeKind,
    NodeTypeRegistry, TIMEOUT_OPTION,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable, validated view of a graph prepared for one run
pub(crate) struct RunPlan {
    pub graph: Graph,
    pub definitions: HashMap<NodeId, NodeDefinition>,
    /// Schema defaults overlaid with each node's config
    pub configs: HashMap<NodeId, Config>,
    pub executors: HashMap<NodeId, Arc<dyn NodeExecutor>>,
    pub scopes: LoopScopes,
    pub start: NodeId,
}

impl RunPlan {
    /// Validate the graph and instantiate one executor per node
    pub fn build(
        graph: Graph,
        types: &NodeTypeRegistry,
        executors: &ExecutorRegistry,
    ) -> Result<Self, FlowError> {
        let issues = validator::validate(&graph, types);
        if !validator::is_runnable(&issues) {
            return Err(FlowError::Validation(issues));
        }

        let mut definitions = HashMap::new();
        let mut configs = HashMap::new();
        let mut instances = HashMap::new();
        let mut config_issues = Vec::new();

        for node in &graph.nodes {
            let definition = types.get(&node.node_type)?.clone();
            let config = definition.effective_config(&node.config);
            match executors.create(&node.node_type, &config) {
                Ok(executor) => {
                    instances.insert(node.id.clone(), executor);
                }
                Err(FlowError::Node(e)) => config_issues.push(
                    ValidationIssue::error(format!("invalid configuration: {}", e)).on_node(&node.id),
                ),
                Err(other) => return Err(other),
            }
            definitions.insert(node.id.clone(), definition);
            configs.insert(node.id.clone(), config);
        }
        if !config_issues.is_empty() {
            return Err(FlowError::Validation(config_issues));
        }

        let start = graph
            .nodes_of_type(NodeKind::Input.as_str())
            .next()
            .map(|n| n.id.clone())
            .ok_or_else(|| FlowError::Invariant("validated graph has no start node".into()))?;
        let scopes = LoopScopes::new(&graph);

        Ok(Self {
            graph,
            definitions,
            configs,
            executors: instances,
            scopes,
            start,
        })
    }

    pub fn kind(&self, node: &str) -> Option<NodeKind> {
        self.graph
            .node(node)
            .and_then(|n| NodeKind::from_type(&n.node_type))
    }

    pub fn node_type(&self, node: &str) -> &str {
        self.graph.node(node).map_or("", |n| n.node_type.as_str())
    }

    /// Incoming edges that gate activation (loop feedback edges excluded)
    pub fn incoming<'a>(&'a self, node: &'a str) -> Vec<&'a Edge> {
        self.graph
            .incoming(node)
            .filter(|e| !self.scopes.is_back_edge(e))
            .collect()
    }

    /// Per-invocation timeout: the node's `timeoutMs`, else the runtime default for
    /// ordinary kinds. Loops and approvals only time out when asked to.
    pub fn timeout_ms(&self, node: &str, default: Option<u64>) -> Option<u64> {
        let explicit = self
            .configs
            .get(node)
            .and_then(|c| c.get(TIMEOUT_OPTION))
            .and_then(|v| v.as_u64());
        let coordinator = self.kind(node).map_or(false, NodeKind::is_coordinator);
        explicit.or(if coordinator { None } else { default })
    }

    /// `output` terminals must succeed unless configured `required: false`
    pub fn is_required_output(&self, node: &str) -> bool {
        self.kind(node) == Some(NodeKind::Output)
            && self
                .configs
                .get(node)
                .and_then(|c| c.get("required"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true)
    }
}
