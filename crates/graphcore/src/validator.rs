//! Pre-run structural checks over a graph snapshot
//!
//! Returns every issue found, not just the first. Only `Error` issues block a run.

use crate::definition::{FanIn, NodeKind};
use crate::graph::{EdgeId, Graph, NodeId};
use crate::registry::NodeTypeRegistry;
use crate::topology::{self, LoopScopes};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<EdgeId>,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            node_id: None,
            edge_id: None,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn on_node(mut self, node: &str) -> Self {
        self.node_id = Some(node.to_string());
        self
    }

    pub fn on_edge(mut self, edge: &str) -> Self {
        self.edge_id = Some(edge.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "[{}]", level)?;
        if let Some(node) = &self.node_id {
            write!(f, " node {}", node)?;
        }
        if let Some(edge) = &self.edge_id {
            write!(f, " edge {}", edge)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// True when none of the issues blocks a run
pub fn is_runnable(issues: &[ValidationIssue]) -> bool {
    !issues.iter().any(ValidationIssue::is_error)
}

/// Validate `graph` against the node catalog
pub fn validate(graph: &Graph, registry: &NodeTypeRegistry) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    check_integrity(graph, registry, &mut issues);
    check_required_inputs(graph, registry, &mut issues);
    check_reachability(graph, &mut issues);
    check_cycles(graph, &mut issues);
    check_terminals(graph, &mut issues);

    issues
}

/// Unknown kinds, duplicate ids and dangling edges (possible in hand-written JSON)
fn check_integrity(graph: &Graph, registry: &NodeTypeRegistry, issues: &mut Vec<ValidationIssue>) {
    let mut ids = HashSet::new();
    for node in &graph.nodes {
        if !ids.insert(node.id.as_str()) {
            issues.push(ValidationIssue::error("duplicate node id").on_node(&node.id));
        }
        if !registry.contains(&node.node_type) {
            issues.push(
                ValidationIssue::error(format!("unknown node type '{}'", node.node_type))
                    .on_node(&node.id),
            );
        }
    }

    for edge in &graph.edges {
        for (end, port, want_output) in [(&edge.from.node, &edge.from.port, true), (&edge.to.node, &edge.to.port, false)] {
            let Some(node) = graph.node(end) else {
                issues.push(
                    ValidationIssue::error(format!("references missing node '{}'", end))
                        .on_edge(&edge.id),
                );
                continue;
            };
            let Ok(def) = registry.get(&node.node_type) else {
                continue;
            };
            let found = if want_output {
                def.output(port).is_some()
            } else {
                def.input(port).is_some()
            };
            if !found {
                issues.push(
                    ValidationIssue::error(format!("port '{}' not found on node '{}'", port, end))
                        .on_edge(&edge.id),
                );
            }
        }
    }
}

fn check_required_inputs(graph: &Graph, registry: &NodeTypeRegistry, issues: &mut Vec<ValidationIssue>) {
    for node in &graph.nodes {
        let Ok(def) = registry.get(&node.node_type) else {
            continue;
        };
        for port in &def.inputs {
            let incoming = graph
                .incoming(&node.id)
                .filter(|e| e.to.port == port.name)
                .count();
            if port.required && incoming == 0 {
                issues.push(
                    ValidationIssue::error(format!("required input '{}' is not connected", port.name))
                        .on_node(&node.id),
                );
            }
            if port.fan_in == FanIn::Single && incoming > 1 {
                issues.push(
                    ValidationIssue::error(format!(
                        "input '{}' has {} incoming edges, only join/merge inputs accept more than one",
                        port.name, incoming
                    ))
                    .on_node(&node.id),
                );
            }
        }
    }
}

fn start_nodes(graph: &Graph) -> Vec<&str> {
    graph
        .nodes_of_type(NodeKind::Input.as_str())
        .map(|n| n.id.as_str())
        .collect()
}

fn check_reachability(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let starts = start_nodes(graph);
    let [start] = starts.as_slice() else {
        return;
    };
    let reachable = topology::reachable_from(graph, start, |_| true);
    for node in &graph.nodes {
        if node.id != *start && !reachable.contains(&node.id) {
            issues.push(
                ValidationIssue::warning("not reachable from the start node").on_node(&node.id),
            );
        }
    }
}

/// Any cycle is an error unless it closes through a loop node's feedback input
fn check_cycles(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let scopes = LoopScopes::new(graph);
    for edge in graph.edges.iter().filter(|e| scopes.leaves_body(e)) {
        let loop_id = scopes.scope_of(&edge.from.node).unwrap_or_default();
        issues.push(
            ValidationIssue::error(format!(
                "edge leaves the body of loop '{}'; only the loop's feedback input may consume body values",
                loop_id
            ))
            .on_edge(&edge.id),
        );
    }

    let mut dag: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &graph.nodes {
        index.entry(node.id.as_str()).or_insert_with(|| dag.add_node(node.id.as_str()));
    }
    for edge in &graph.edges {
        if scopes.is_back_edge(edge) {
            continue;
        }
        if let (Some(&from), Some(&to)) = (index.get(edge.from.node.as_str()), index.get(edge.to.node.as_str())) {
            dag.add_edge(from, to, ());
        }
    }

    let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&dag)
        .into_iter()
        .filter(|scc| scc.len() > 1 || dag.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .collect();
    cycles.sort();

    for scc in cycles {
        let members: Vec<&str> = scc.iter().map(|&i| dag[i]).collect();
        issues.push(
            ValidationIssue::error(format!("cycle through {}", members.join(" -> ")))
                .on_node(members[0]),
        );
    }
}

fn check_terminals(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let starts = start_nodes(graph);
    match starts.len() {
        0 => issues.push(ValidationIssue::error("graph has no input (start) node")),
        1 => {}
        _ => {
            for extra in &starts[1..] {
                issues.push(
                    ValidationIssue::error("graph has more than one input (start) node").on_node(extra),
                );
            }
        }
    }
    if graph.nodes_of_type(NodeKind::Output.as_str()).next().is_none() {
        issues.push(ValidationIssue::error("graph has no output (terminal) node"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{category, NodeDefinition, Port};
    use crate::graph::{Edge, Endpoint, GraphNode};
    use crate::value::DataType;

    fn registry() -> NodeTypeRegistry {
        let mut registry = NodeTypeRegistry::new();
        let defs = [
            NodeDefinition::new("input", category::IO).with_output(Port::output("output", DataType::Any)),
            NodeDefinition::new("output", category::IO).with_input(Port::input("input", DataType::Any).required()),
            NodeDefinition::new("tool", category::AGENTS)
                .with_input(Port::input("input", DataType::Any).required())
                .with_output(Port::output("output", DataType::Any)),
            NodeDefinition::new("join", category::CONTROL)
                .with_input(Port::input("inputs", DataType::Any).required().with_fan_in(FanIn::All))
                .with_output(Port::output("output", DataType::Array)),
            NodeDefinition::new("loop", category::CONTROL)
                .with_input(Port::input("items", DataType::Array).required())
                .with_input(Port::input("feedback", DataType::Any))
                .with_output(Port::output("item", DataType::Any))
                .with_output(Port::output("index", DataType::Number))
                .with_output(Port::output("complete", DataType::Array)),
        ];
        for def in defs {
            registry.register(def).unwrap();
        }
        registry
    }

    fn graph(nodes: &[(&str, &str)], edges: &[(&str, &str, &str, &str)]) -> Graph {
        let mut graph = Graph::new();
        for (id, kind) in nodes {
            graph.nodes.push(GraphNode::new(*id, *kind));
        }
        for (i, (a, ap, b, bp)) in edges.iter().enumerate() {
            graph.edges.push(Edge::new(format!("e{}", i), Endpoint::new(*a, *ap), Endpoint::new(*b, *bp)));
        }
        graph
    }

    #[test]
    fn clean_graph_has_no_issues() {
        let g = graph(
            &[("in", "input"), ("t", "tool"), ("out", "output")],
            &[("in", "output", "t", "input"), ("t", "output", "out", "input")],
        );
        assert!(validate(&g, &registry()).is_empty());
    }

    #[test]
    fn missing_and_doubled_inputs_are_errors() {
        let g = graph(
            &[("in", "input"), ("a", "tool"), ("b", "tool"), ("t", "tool"), ("out", "output")],
            &[
                ("in", "output", "a", "input"),
                ("in", "output", "b", "input"),
                ("a", "output", "t", "input"),
                ("b", "output", "t", "input"),
            ],
        );
        let issues = validate(&g, &registry());
        assert!(issues.iter().any(|i| i.node_id.as_deref() == Some("t") && i.message.contains("2 incoming")));
        assert!(issues.iter().any(|i| i.node_id.as_deref() == Some("out") && i.message.contains("not connected")));
        assert!(!is_runnable(&issues));
    }

    #[test]
    fn join_accepts_many_edges() {
        let g = graph(
            &[("in", "input"), ("a", "tool"), ("b", "tool"), ("j", "join"), ("out", "output")],
            &[
                ("in", "output", "a", "input"),
                ("in", "output", "b", "input"),
                ("a", "output", "j", "inputs"),
                ("b", "output", "j", "inputs"),
                ("j", "output", "out", "input"),
            ],
        );
        assert!(validate(&g, &registry()).is_empty());
    }

    #[test]
    fn unreachable_nodes_only_warn() {
        let g = graph(
            &[("in", "input"), ("out", "output"), ("island", "output"), ("src", "input")],
            &[("in", "output", "out", "input"), ("src", "output", "island", "input")],
        );
        let issues = validate(&g, &registry());
        // two start nodes is an error, reachability is skipped in that case
        assert!(issues.iter().any(|i| i.message.contains("more than one input")));

        let g = graph(
            &[("in", "input"), ("out", "output"), ("t", "tool"), ("island", "output")],
            &[("in", "output", "out", "input"), ("t", "output", "island", "input")],
        );
        let issues = validate(&g, &registry());
        let warnings: Vec<_> = issues.iter().filter(|i| i.severity == Severity::Warning).collect();
        assert_eq!(warnings.len(), 2);
        assert!(issues.iter().any(|i| i.is_error() && i.node_id.as_deref() == Some("t")));
    }

    #[test]
    fn cycles_are_errors_except_loop_feedback() {
        let cyclic = graph(
            &[("in", "input"), ("a", "tool"), ("b", "tool"), ("j", "join"), ("out", "output")],
            &[
                ("in", "output", "j", "inputs"),
                ("j", "output", "a", "input"),
                ("a", "output", "b", "input"),
                ("b", "output", "j", "inputs"),
                ("b", "output", "out", "input"),
            ],
        );
        let issues = validate(&cyclic, &registry());
        assert!(issues.iter().any(|i| i.is_error() && i.message.starts_with("cycle through")));

        let looped = graph(
            &[("in", "input"), ("l", "loop"), ("a", "tool"), ("out", "output")],
            &[
                ("in", "output", "l", "items"),
                ("l", "item", "a", "input"),
                ("a", "output", "l", "feedback"),
                ("l", "complete", "out", "input"),
            ],
        );
        assert!(validate(&looped, &registry()).is_empty());

        let escaping = graph(
            &[("in", "input"), ("l", "loop"), ("a", "tool"), ("out", "output")],
            &[
                ("in", "output", "l", "items"),
                ("l", "item", "a", "input"),
                ("a", "output", "out", "input"),
            ],
        );
        let issues = validate(&escaping, &registry());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].edge_id.as_deref(), Some("e2"));
    }

    #[test]
    fn start_and_terminal_are_required() {
        let g = graph(&[("t", "tool")], &[]);
        let issues = validate(&g, &registry());
        assert!(issues.iter().any(|i| i.message.contains("no input")));
        assert!(issues.iter().any(|i| i.message.contains("no output")));
    }

    #[test]
    fn validation_is_deterministic() {
        let g = graph(
            &[("in", "input"), ("a", "tool"), ("b", "tool"), ("c", "tool"), ("ghost", "warp")],
            &[("a", "output", "b", "input"), ("b", "output", "a", "input"), ("c", "output", "nowhere", "input")],
        );
        let registry = registry();
        assert_eq!(validate(&g, &registry), validate(&g, &registry));
    }
}
