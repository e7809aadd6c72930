//! Reachability and loop-body queries shared by the validator and the engine.

use crate::definition::NodeKind;
use crate::graph::{Edge, Graph, NodeId};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Output ports of a loop node that feed its body
pub const LOOP_BODY_PORTS: &[&str] = &["item", "index"];

/// Input port of a loop node that receives each iteration's result
pub const LOOP_FEEDBACK_PORT: &str = "feedback";

/// Nodes reachable from `start` following edges forward (excluding `start` itself
/// unless it is re-entered). Edges for which `follow` returns false are ignored.
pub fn reachable_from<F>(graph: &Graph, start: &str, follow: F) -> HashSet<NodeId>
where
    F: Fn(&Edge) -> bool,
{
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        for edge in graph.outgoing(&current) {
            if follow(edge) && seen.insert(edge.to.node.clone()) {
                queue.push_back(edge.to.node.clone());
            }
        }
    }
    seen
}

/// Body of a loop node: everything reachable from its `item`/`index` ports without
/// passing back through the loop itself, in graph order.
///
/// Output terminals hold one value per run, so they never join a body. An edge from a
/// body into a terminal leaves the body.
pub fn loop_body(graph: &Graph, loop_id: &str) -> Vec<NodeId> {
    let terminal = |id: &str| {
        graph
            .node(id)
            .map_or(false, |n| NodeKind::from_type(&n.node_type) == Some(NodeKind::Output))
    };
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = graph
        .outgoing(loop_id)
        .filter(|e| LOOP_BODY_PORTS.contains(&e.from.port.as_str()) && e.to.node != loop_id)
        .map(|e| e.to.node.clone())
        .collect();
    while let Some(current) = queue.pop_front() {
        if terminal(&current) || !seen.insert(current.clone()) {
            continue;
        }
        for edge in graph.outgoing(&current) {
            if edge.to.node != loop_id && !seen.contains(&edge.to.node) {
                queue.push_back(edge.to.node.clone());
            }
        }
    }
    graph
        .nodes
        .iter()
        .filter(|n| seen.contains(&n.id))
        .map(|n| n.id.clone())
        .collect()
}

/// Loop bodies of a graph and the innermost loop enclosing each node
///
/// Nodes outside every body belong to the main scope (`None`). Nested loops give
/// nested scopes; a node reachable from two unrelated loops is assigned to the one
/// with the smaller body.
#[derive(Debug, Clone, Default)]
pub struct LoopScopes {
    bodies: BTreeMap<NodeId, Vec<NodeId>>,
    scope: HashMap<NodeId, NodeId>,
}

impl LoopScopes {
    pub fn new(graph: &Graph) -> Self {
        let bodies: BTreeMap<NodeId, Vec<NodeId>> = graph
            .nodes
            .iter()
            .filter(|n| NodeKind::from_type(&n.node_type) == Some(NodeKind::Loop))
            .map(|n| (n.id.clone(), loop_body(graph, &n.id)))
            .collect();

        let mut scope: HashMap<NodeId, NodeId> = HashMap::new();
        for node in &graph.nodes {
            let innermost = graph
                .nodes
                .iter()
                .filter_map(|l| bodies.get(&l.id).map(|body| (&l.id, body)))
                .filter(|(_, body)| body.contains(&node.id))
                .min_by_key(|(_, body)| body.len());
            if let Some((loop_id, _)) = innermost {
                scope.insert(node.id.clone(), loop_id.clone());
            }
        }

        Self { bodies, scope }
    }

    /// Innermost loop whose body contains `node`
    pub fn scope_of(&self, node: &str) -> Option<&str> {
        self.scope.get(node).map(String::as_str)
    }

    pub fn is_loop(&self, node: &str) -> bool {
        self.bodies.contains_key(node)
    }

    /// Every node in the body of `loop_id`, nested bodies included
    pub fn body(&self, loop_id: &str) -> &[NodeId] {
        self.bodies.get(loop_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes whose innermost scope is exactly `scope`, in graph order
    pub fn members(&self, graph: &Graph, scope: Option<&str>) -> Vec<NodeId> {
        graph
            .nodes
            .iter()
            .filter(|n| self.scope_of(&n.id) == scope)
            .map(|n| n.id.clone())
            .collect()
    }

    /// `outer` is `inner` or one of its enclosing scopes
    pub fn encloses(&self, outer: Option<&str>, inner: Option<&str>) -> bool {
        let mut current = inner;
        // bounded by the number of loops, guards against malformed nesting
        for _ in 0..=self.bodies.len() {
            if current == outer {
                return true;
            }
            match current {
                None => return false,
                Some(loop_id) => current = self.scope_of(loop_id),
            }
        }
        false
    }

    /// An edge into a loop's feedback port coming from that loop's own body
    pub fn is_back_edge(&self, edge: &Edge) -> bool {
        edge.to.port == LOOP_FEEDBACK_PORT
            && self.is_loop(&edge.to.node)
            && (edge.from.node == edge.to.node || self.body(&edge.to.node).contains(&edge.from.node))
    }

    /// Edges that carry a value out of a loop body to anything but the loop's feedback
    pub fn leaves_body(&self, edge: &Edge) -> bool {
        !self.is_back_edge(edge)
            && !self.encloses(self.scope_of(&edge.from.node), self.scope_of(&edge.to.node))
    }

    /// Edges into the body of `loop_id` from outside it (other than the loop itself)
    pub fn body_inputs<'a>(&'a self, graph: &'a Graph, loop_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        let body = self.body(loop_id);
        graph.edges.iter().filter(move |e| {
            e.from.node != loop_id && body.contains(&e.to.node) && !body.contains(&e.from.node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Endpoint, GraphNode};

    fn edge(id: &str, from: (&str, &str), to: (&str, &str)) -> Edge {
        Edge::new(id, Endpoint::new(from.0, from.1), Endpoint::new(to.0, to.1))
    }

    fn looped() -> Graph {
        let mut graph = Graph::new();
        for (id, kind) in [("in", "input"), ("l", "loop"), ("a", "agent"), ("b", "tool"), ("out", "output")] {
            graph.nodes.push(GraphNode::new(id, kind));
        }
        graph.edges = vec![
            edge("e1", ("in", "output"), ("l", "items")),
            edge("e2", ("l", "item"), ("a", "input")),
            edge("e3", ("a", "output"), ("b", "input")),
            edge("e4", ("b", "output"), ("l", "feedback")),
            edge("e5", ("l", "complete"), ("out", "input")),
        ];
        graph
    }

    #[test]
    fn loop_body_stops_at_the_loop() {
        let graph = looped();
        assert_eq!(loop_body(&graph, "l"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn feedback_edge_is_recognised() {
        let graph = looped();
        let scopes = LoopScopes::new(&graph);
        assert!(scopes.is_back_edge(&graph.edges[3]));
        assert!(!scopes.is_back_edge(&graph.edges[0]));
        assert!(graph.edges.iter().all(|e| !scopes.leaves_body(e)));
    }

    #[test]
    fn scopes_nest() {
        let mut graph = looped();
        graph.nodes.push(GraphNode::new("inner", "loop"));
        graph.nodes.push(GraphNode::new("c", "tool"));
        graph.edges.push(edge("e6", ("a", "output"), ("inner", "items")));
        graph.edges.push(edge("e7", ("inner", "item"), ("c", "input")));
        graph.edges.push(edge("e8", ("c", "output"), ("out", "input")));
        graph.edges.push(edge("e9", ("b", "output"), ("c", "context")));
        let scopes = LoopScopes::new(&graph);

        assert_eq!(scopes.scope_of("in"), None);
        assert_eq!(scopes.scope_of("a"), Some("l"));
        assert_eq!(scopes.scope_of("inner"), Some("l"));
        assert_eq!(scopes.scope_of("c"), Some("inner"));
        assert_eq!(scopes.members(&graph, Some("l")), vec!["a", "b", "inner"]);
        assert!(scopes.encloses(None, Some("inner")));
        assert!(!scopes.encloses(Some("inner"), Some("l")));
        // c -> out escapes both bodies
        assert!(scopes.leaves_body(&graph.edges[7]));
        assert_eq!(scopes.body_inputs(&graph, "inner").count(), 1);
    }

    #[test]
    fn terminals_stay_outside_bodies() {
        let mut graph = looped();
        graph.nodes.push(GraphNode::new("late", "output"));
        graph.edges.push(edge("e6", ("a", "output"), ("late", "input")));
        let scopes = LoopScopes::new(&graph);

        assert_eq!(scopes.body("l"), ["a".to_string(), "b".to_string()]);
        assert_eq!(scopes.scope_of("late"), None);
        assert!(scopes.leaves_body(&graph.edges[5]));
    }

    #[test]
    fn reachability_respects_filter() {
        let graph = looped();
        let all = reachable_from(&graph, "in", |_| true);
        assert!(all.contains("out") && all.contains("b"));
        let no_complete = reachable_from(&graph, "in", |e| e.from.port != "complete");
        assert!(!no_complete.contains("out"));
    }
}
