use crate::value::Config;
use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type EdgeId = String;

/// Persisted workflow graph: the load/save boundary with editors and storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a graph from its JSON form
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Save a graph to its JSON form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Edges ending at `node`, in edge order
    pub fn incoming<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to.node == node)
    }

    /// Edges leaving `node`, in edge order
    pub fn outgoing<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from.node == node)
    }

    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a GraphNode> + 'a {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }
}

/// Node instance in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Config,
    /// Editor metadata (position, labels, ...) carried through load/save untouched
    #[serde(flatten)]
    pub extra: Config,
}

impl GraphNode {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: Config::new(),
            extra: Config::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// One end of an edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub port: String,
}

impl Endpoint {
    pub fn new(node: impl Into<NodeId>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

/// Descriptive role of an edge. Does not change execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Default,
    Success,
    Error,
    Conditional,
}

/// Directed connection from an output port to an input port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub from: Endpoint,
    pub to: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_kind: Option<PathKind>,
}

impl Edge {
    pub fn new(id: impl Into<EdgeId>, from: Endpoint, to: Endpoint) -> Self {
        Self {
            id: id.into(),
            from,
            to,
            condition: None,
            path_kind: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Same endpoints as `other`
    pub fn same_route(&self, other: &Edge) -> bool {
        self.from == other.from && self.to == other.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_of_load_is_identity() {
        let original = json!({
            "nodes": [
                {"id": "start", "type": "input", "config": {}},
                {"id": "check", "type": "condition", "config": {"condition": "x > 5"}, "position": {"x": 10, "y": 20}},
                {"id": "hi", "type": "output", "config": {}}
            ],
            "edges": [
                {"id": "e1", "from": {"node": "start", "port": "output"}, "to": {"node": "check", "port": "input"}},
                {"id": "e2", "from": {"node": "check", "port": "true"}, "to": {"node": "hi", "port": "input"},
                 "condition": "x > 5", "pathKind": "conditional"}
            ]
        });
        let graph = Graph::from_json(&original.to_string()).unwrap();
        assert_eq!(graph.nodes[1].extra.get("position"), Some(&json!({"x": 10, "y": 20})));
        let saved: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(saved, original);
    }

    #[test]
    fn incoming_and_outgoing_follow_edge_order() {
        let mut graph = Graph::new();
        graph.nodes.push(GraphNode::new("a", "input"));
        graph.nodes.push(GraphNode::new("b", "output"));
        graph.edges.push(Edge::new("e1", Endpoint::new("a", "output"), Endpoint::new("b", "input")));
        assert_eq!(graph.outgoing("a").count(), 1);
        assert_eq!(graph.incoming("b").next().map(|e| e.id.as_str()), Some("e1"));
        assert_eq!(graph.incoming("a").count(), 0);
    }
}
