//! Per-run state: write-once port bindings, node states and the run record.

use chrono::{DateTime, Utc};
use graphcore::{
    FlowError, Graph, NodeId, NodeMetrics, NodeStatus, PortValues, RunId, RunStatus, SkipReason,
    Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values published by completed nodes, keyed by node then output port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeContext {
    bindings: BTreeMap<NodeId, BTreeMap<String, Value>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `node.port`. Each key is written at most once per run.
    pub fn bind(&mut self, node: &str, port: &str, value: Value) -> Result<(), FlowError> {
        let ports = self.bindings.entry(node.to_string()).or_default();
        if ports.contains_key(port) {
            return Err(FlowError::Invariant(format!(
                "{}.{} bound twice",
                node, port
            )));
        }
        ports.insert(port.to_string(), value);
        Ok(())
    }

    pub fn get(&self, node: &str, port: &str) -> Option<&Value> {
        self.bindings.get(node).and_then(|ports| ports.get(port))
    }

    pub fn outputs_of(&self, node: &str) -> Option<&BTreeMap<String, Value>> {
        self.bindings.get(node)
    }

    pub fn is_bound(&self, node: &str, port: &str) -> bool {
        self.get(node, port).is_some()
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State of one node within a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Values by output port; set on success (and on routed errors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BTreeMap<String, Value>>,
    /// Present iff status is error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub metrics: NodeMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Loop iteration that last touched this node, for loop body members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl RuntimeState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Full picture of one run: graph snapshot, node states and bindings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub graph: Graph,
    pub inputs: PortValues,
    pub nodes: BTreeMap<NodeId, RuntimeState>,
    pub context: RuntimeContext,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: RunId, graph: Graph, inputs: PortValues) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), RuntimeState::default()))
            .collect();
        Self {
            run_id,
            status: RunStatus::Pending,
            graph,
            inputs,
            nodes,
            context: RuntimeContext::new(),
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&RuntimeState> {
        self.nodes.get(id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|state| state.status)
    }

    /// Values received by the `output` terminals, keyed by node id
    pub fn outputs(&self) -> BTreeMap<NodeId, Value> {
        self.graph
            .nodes_of_type(graphcore::NodeKind::Output.as_str())
            .filter_map(|n| {
                self.context
                    .get(&n.id, "output")
                    .map(|value| (n.id.clone(), value.clone()))
            })
            .collect()
    }

    /// Nodes currently suspended on human approval
    pub fn waiting_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, state)| state.status == NodeStatus::Waiting)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bindings_are_write_once() {
        let mut ctx = RuntimeContext::new();
        ctx.bind("a", "output", json!(1)).unwrap();
        ctx.bind("a", "error", json!("x")).unwrap();
        let err = ctx.bind("a", "output", json!(2)).unwrap_err();
        assert!(matches!(err, FlowError::Invariant(_)));
        assert_eq!(ctx.get("a", "output"), Some(&json!(1)));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn record_starts_idle() {
        let graph = Graph::from_json(
            r#"{"nodes":[{"id":"in","type":"input"},{"id":"out","type":"output"}],"edges":[]}"#,
        )
        .unwrap();
        let record = RunRecord::new(uuid::Uuid::new_v4(), graph, PortValues::new());
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.node_status("out"), Some(NodeStatus::Idle));
        assert!(record.outputs().is_empty());
    }
}
