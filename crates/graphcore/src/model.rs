//! Mutable graph owned by the caller, changed only through checked operations.
//!
//! Every mutation has an inverse ([`GraphOp`]) so an undo/redo stack can be layered on top
//! without the model knowing about it.

use crate::definition::{NodeDefinition, PortDirection};
use crate::error::GraphError;
use crate::graph::{Edge, EdgeId, Endpoint, Graph, GraphNode, NodeId};
use crate::registry::NodeTypeRegistry;
use crate::validator::{self, ValidationIssue};
use crate::value::Config;
use std::sync::Arc;
use uuid::Uuid;

/// A single reversible mutation
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    /// Insert a node (id included) exactly as given
    AddNode(GraphNode),
    /// Remove a node and every edge touching it
    RemoveNode(NodeId),
    /// Insert an edge (id included)
    Connect(Edge),
    Disconnect(EdgeId),
    /// Replace a node's whole config
    SetConfig { node: NodeId, config: Config },
    /// Several ops applied in order, undone in reverse
    Batch(Vec<GraphOp>),
}

/// What `remove_node` took out of the graph
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub node: GraphNode,
    pub edges: Vec<Edge>,
}

impl RemovedNode {
    /// Operation that puts the node and its edges back
    pub fn restore_op(&self) -> GraphOp {
        let mut ops = vec![GraphOp::AddNode(self.node.clone())];
        ops.extend(self.edges.iter().cloned().map(GraphOp::Connect));
        GraphOp::Batch(ops)
    }
}

pub struct GraphModel {
    registry: Arc<NodeTypeRegistry>,
    graph: Graph,
}

impl GraphModel {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            registry,
            graph: Graph::new(),
        }
    }

    /// Load a persisted graph, re-checking every node and edge
    pub fn from_graph(registry: Arc<NodeTypeRegistry>, graph: Graph) -> Result<Self, GraphError> {
        let mut model = Self::new(registry);
        for node in graph.nodes {
            model.insert_node(node)?;
        }
        for edge in graph.edges {
            model.insert_edge(edge)?;
        }
        Ok(model)
    }

    pub fn registry(&self) -> &Arc<NodeTypeRegistry> {
        &self.registry
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Owned copy of the current graph
    pub fn snapshot(&self) -> Graph {
        self.graph.clone()
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn validate(&self) -> Vec<ValidationIssue> {
        validator::validate(&self.graph, &self.registry)
    }

    fn definition(&self, node_type: &str) -> Result<&NodeDefinition, GraphError> {
        self.registry
            .get(node_type)
            .map_err(|_| GraphError::UnknownType(node_type.to_string()))
    }

    fn definition_of(&self, node_id: &str) -> Result<&NodeDefinition, GraphError> {
        let node = self
            .graph
            .node(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
        self.definition(&node.node_type)
    }

    /// Add a node of `node_type` with schema defaults, overridden by `config`
    pub fn add_node(&mut self, node_type: &str, config: Option<Config>) -> Result<NodeId, GraphError> {
        let definition = self.definition(node_type)?;
        let mut node_config = definition.defaults();
        for (key, value) in config.unwrap_or_default() {
            definition.check_option(&key, &value)?;
            if value.is_null() {
                node_config.remove(&key);
            } else {
                node_config.insert(key, value);
            }
        }

        let id = format!("{}-{}", node_type, &Uuid::new_v4().simple().to_string()[..8]);
        let node = GraphNode {
            id: id.clone(),
            node_type: node_type.to_string(),
            config: node_config,
            extra: Config::new(),
        };
        self.graph.nodes.push(node);
        Ok(id)
    }

    /// Insert a fully-formed node, keeping its id and config as given
    pub fn insert_node(&mut self, node: GraphNode) -> Result<(), GraphError> {
        if self.graph.contains_node(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let definition = self.definition(&node.node_type)?;
        for (key, value) in &node.config {
            definition.check_option(key, value)?;
        }
        self.graph.nodes.push(node);
        Ok(())
    }

    /// Remove a node together with every edge touching it
    pub fn remove_node(&mut self, id: &str) -> Result<RemovedNode, GraphError> {
        let position = self
            .graph
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        let node = self.graph.nodes.remove(position);

        let (removed, kept): (Vec<Edge>, Vec<Edge>) = std::mem::take(&mut self.graph.edges)
            .into_iter()
            .partition(|e| e.from.node == id || e.to.node == id);
        self.graph.edges = kept;

        Ok(RemovedNode {
            node,
            edges: removed,
        })
    }

    /// Connect `from_node.from_port` to `to_node.to_port`
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        condition: Option<String>,
    ) -> Result<EdgeId, GraphError> {
        let id = format!("e-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let mut edge = Edge::new(
            id.clone(),
            Endpoint::new(from_node, from_port),
            Endpoint::new(to_node, to_port),
        );
        edge.condition = condition;
        self.insert_edge(edge)?;
        Ok(id)
    }

    /// Insert a fully-formed edge after checking endpoints, direction and types
    pub fn insert_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if self.graph.edge(&edge.id).is_some() {
            return Err(GraphError::DuplicateEdgeId(edge.id));
        }
        self.check_edge(&edge)?;
        self.graph.edges.push(edge);
        Ok(())
    }

    fn check_edge(&self, edge: &Edge) -> Result<(), GraphError> {
        let from_def = self.definition_of(&edge.from.node)?;
        let to_def = self.definition_of(&edge.to.node)?;

        if edge.from.node == edge.to.node && !from_def.feedback_capable {
            return Err(GraphError::SelfLoop(edge.from.node.clone()));
        }

        let from_port = match from_def.output(&edge.from.port) {
            Some(port) => port,
            None if from_def.input(&edge.from.port).is_some() => {
                return Err(GraphError::DirectionMismatch {
                    node: edge.from.node.clone(),
                    port: edge.from.port.clone(),
                    expected: PortDirection::Output.to_string(),
                    actual: PortDirection::Input.to_string(),
                })
            }
            None => {
                return Err(GraphError::PortNotFound {
                    node: edge.from.node.clone(),
                    port: edge.from.port.clone(),
                })
            }
        };

        let to_port = match to_def.input(&edge.to.port) {
            Some(port) => port,
            None if to_def.outputs.iter().any(|p| p.name == edge.to.port) => {
                return Err(GraphError::DirectionMismatch {
                    node: edge.to.node.clone(),
                    port: edge.to.port.clone(),
                    expected: PortDirection::Input.to_string(),
                    actual: PortDirection::Output.to_string(),
                })
            }
            None => {
                return Err(GraphError::PortNotFound {
                    node: edge.to.node.clone(),
                    port: edge.to.port.clone(),
                })
            }
        };

        if !from_port.data_type.compatible_with(to_port.data_type) {
            return Err(GraphError::TypeMismatch {
                from_node: edge.from.node.clone(),
                from_port: edge.from.port.clone(),
                from_type: from_port.data_type.to_string(),
                to_node: edge.to.node.clone(),
                to_port: edge.to.port.clone(),
                to_type: to_port.data_type.to_string(),
            });
        }

        if self.graph.edges.iter().any(|e| e.same_route(edge)) {
            return Err(GraphError::DuplicateEdge {
                from_node: edge.from.node.clone(),
                from_port: edge.from.port.clone(),
                to_node: edge.to.node.clone(),
                to_port: edge.to.port.clone(),
            });
        }

        Ok(())
    }

    pub fn disconnect(&mut self, edge_id: &str) -> Result<Edge, GraphError> {
        let position = self
            .graph
            .edges
            .iter()
            .position(|e| e.id == edge_id)
            .ok_or_else(|| GraphError::EdgeNotFound(edge_id.to_string()))?;
        Ok(self.graph.edges.remove(position))
    }

    /// Merge `patch` into the node's config. `null` resets an option to its default.
    ///
    /// Returns the config as it was before the patch.
    pub fn update_config(&mut self, node_id: &str, patch: Config) -> Result<Config, GraphError> {
        let definition = self.definition_of(node_id)?.clone();
        for (key, value) in &patch {
            definition.check_option(key, value)?;
        }

        let node = self
            .graph
            .node_mut(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
        let previous = node.config.clone();
        for (key, value) in patch {
            if value.is_null() {
                match definition.config_schema.get(&key) {
                    Some(option) if !option.default.is_null() => {
                        node.config.insert(key, option.default.clone());
                    }
                    _ => {
                        node.config.remove(&key);
                    }
                }
            } else {
                node.config.insert(key, value);
            }
        }
        Ok(previous)
    }

    /// Apply `op` and return the operation that undoes it
    pub fn apply(&mut self, op: GraphOp) -> Result<GraphOp, GraphError> {
        match op {
            GraphOp::AddNode(node) => {
                let id = node.id.clone();
                self.insert_node(node)?;
                Ok(GraphOp::RemoveNode(id))
            }
            GraphOp::RemoveNode(id) => Ok(self.remove_node(&id)?.restore_op()),
            GraphOp::Connect(edge) => {
                let id = edge.id.clone();
                self.insert_edge(edge)?;
                Ok(GraphOp::Disconnect(id))
            }
            GraphOp::Disconnect(id) => Ok(GraphOp::Connect(self.disconnect(&id)?)),
            GraphOp::SetConfig { node, config } => {
                let definition = self.definition_of(&node)?;
                for (key, value) in &config {
                    definition.check_option(key, value)?;
                }
                let target = self
                    .graph
                    .node_mut(&node)
                    .ok_or_else(|| GraphError::NodeNotFound(node.clone()))?;
                let previous = std::mem::replace(&mut target.config, config);
                Ok(GraphOp::SetConfig {
                    node,
                    config: previous,
                })
            }
            GraphOp::Batch(ops) => {
                let mut inverses = Vec::with_capacity(ops.len());
                for op in ops {
                    match self.apply(op) {
                        Ok(inverse) => inverses.push(inverse),
                        Err(e) => {
                            // roll back what already went in
                            for inverse in inverses.into_iter().rev() {
                                let _ = self.apply(inverse);
                            }
                            return Err(e);
                        }
                    }
                }
                inverses.reverse();
                Ok(GraphOp::Batch(inverses))
            }
        }
    }
}

/// Inverse of a `connect` call, for callers recording history
pub fn disconnect_op(edge_id: impl Into<EdgeId>) -> GraphOp {
    GraphOp::Disconnect(edge_id.into())
}

/// Operation restoring a previous config returned by `update_config`
pub fn restore_config_op(node: impl Into<NodeId>, previous: Config) -> GraphOp {
    GraphOp::SetConfig {
        node: node.into(),
        config: previous,
    }
}
