//! Activation bookkeeping for one scheduling scope
//!
//! The main scope holds every node outside loop bodies. Each loop iteration gets a
//! fresh scope holding that loop's direct body members. A scope knows, for every
//! incoming edge of its members, whether the value is still pending, was delivered,
//! or will never arrive (and why).

use crate::context::RuntimeContext;
use crate::plan::RunPlan;
use graphcore::{Edge, EdgeId, FanIn, FlowError, NodeId, NodeStatus, PortValues, SkipReason, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What an edge carries, as far as the scope can tell
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    Pending,
    Delivered(Value),
    Dead(SkipReason),
}

/// Activation decision for a non-terminal node
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Readiness {
    /// Still waiting; `partial` when some input is already bound
    Blocked { partial: bool },
    Ready(PortValues),
    Skip(SkipReason),
}

/// Status changes found while settling a scope
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transition {
    Waiting(NodeId),
    Skipped(NodeId, SkipReason),
}

fn severity(reason: SkipReason) -> u8 {
    match reason {
        SkipReason::Branch => 0,
        SkipReason::UpstreamFailure => 1,
        SkipReason::Cancelled => 2,
    }
}

fn worse(current: Option<SkipReason>, reason: SkipReason) -> Option<SkipReason> {
    match current {
        Some(existing) if severity(existing) >= severity(reason) => Some(existing),
        _ => Some(reason),
    }
}

/// Fold the resolutions of all edges into one port according to its fan-in policy
fn combine(fan_in: FanIn, resolutions: Vec<Resolution>) -> Resolution {
    let dead = resolutions.iter().fold(None, |acc, r| match r {
        Resolution::Dead(reason) => worse(acc, *reason),
        _ => acc,
    });
    let pending = resolutions.iter().any(|r| *r == Resolution::Pending);

    match fan_in {
        FanIn::Single => resolutions.into_iter().next().unwrap_or(Resolution::Pending),
        FanIn::All => match dead {
            Some(reason) => Resolution::Dead(reason),
            None if pending => Resolution::Pending,
            None => Resolution::Delivered(Value::Array(
                resolutions
                    .into_iter()
                    .filter_map(|r| match r {
                        Resolution::Delivered(v) => Some(v),
                        _ => None,
                    })
                    .collect(),
            )),
        },
        FanIn::Any => {
            if pending {
                return Resolution::Pending;
            }
            resolutions
                .into_iter()
                .find_map(|r| match r {
                    Resolution::Delivered(v) => Some(Resolution::Delivered(v)),
                    _ => None,
                })
                .unwrap_or(Resolution::Dead(dead.unwrap_or(SkipReason::Branch)))
        }
    }
}

pub(crate) struct Frame {
    /// Loop that owns this scope, `None` for the main scope
    pub scope: Option<NodeId>,
    pub members: Vec<NodeId>,
    member_set: HashSet<NodeId>,
    pub iteration: Option<u32>,
    /// Current item and index for a loop body scope
    loop_values: Option<(Value, Value)>,
    /// Resolutions of edges entering this scope from enclosing scopes
    external: Arc<HashMap<EdgeId, Resolution>>,
    status: HashMap<NodeId, NodeStatus>,
    skip_reasons: HashMap<NodeId, SkipReason>,
    errors: HashMap<NodeId, String>,
    /// Failed nodes whose error payload was routed to an `error` port
    routed: HashSet<NodeId>,
    pub context: RuntimeContext,
    seed: Option<(NodeId, PortValues)>,
    pub cancel: CancellationToken,
}

impl Frame {
    fn with_members(members: Vec<NodeId>, cancel: CancellationToken) -> Self {
        Self {
            scope: None,
            member_set: members.iter().cloned().collect(),
            status: members.iter().map(|m| (m.clone(), NodeStatus::Idle)).collect(),
            members,
            iteration: None,
            loop_values: None,
            external: Arc::new(HashMap::new()),
            skip_reasons: HashMap::new(),
            errors: HashMap::new(),
            routed: HashSet::new(),
            context: RuntimeContext::new(),
            seed: None,
            cancel,
        }
    }

    /// Main scope, with the run inputs seeded into the start node
    pub fn main(plan: &RunPlan, inputs: PortValues, cancel: CancellationToken) -> Self {
        let mut frame = Self::with_members(plan.scopes.members(&plan.graph, None), cancel);
        frame.seed = Some((plan.start.clone(), inputs));
        frame
    }

    /// One iteration of `loop_id`'s body
    pub fn body(
        plan: &RunPlan,
        loop_id: &str,
        index: u32,
        item: Value,
        external: Arc<HashMap<EdgeId, Resolution>>,
        cancel: CancellationToken,
    ) -> Self {
        let mut frame = Self::with_members(plan.scopes.members(&plan.graph, Some(loop_id)), cancel);
        frame.scope = Some(loop_id.to_string());
        frame.iteration = Some(index);
        frame.loop_values = Some((item, Value::from(index)));
        frame.external = external;
        frame
    }

    pub fn is_main(&self) -> bool {
        self.scope.is_none()
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.member_set.contains(node)
    }

    pub fn status_of(&self, node: &str) -> NodeStatus {
        self.status.get(node).copied().unwrap_or_default()
    }

    pub fn skip_reason(&self, node: &str) -> Option<SkipReason> {
        self.skip_reasons.get(node).copied()
    }

    /// First unrouted failure among the members, in graph order
    pub fn first_failure(&self) -> Option<(&NodeId, &String)> {
        self.members
            .iter()
            .filter(|m| !self.routed.contains(*m))
            .find_map(|m| self.errors.get(m).map(|e| (m, e)))
    }

    pub fn resolve(&self, edge: &Edge) -> Resolution {
        let source = edge.from.node.as_str();
        if self.is_member(source) {
            return match self.status_of(source) {
                NodeStatus::Success | NodeStatus::Error => {
                    match self.context.get(source, &edge.from.port) {
                        Some(value) => Resolution::Delivered(value.clone()),
                        None if self.status_of(source) == NodeStatus::Success
                            || self.routed.contains(source) =>
                        {
                            Resolution::Dead(SkipReason::Branch)
                        }
                        None => Resolution::Dead(SkipReason::UpstreamFailure),
                    }
                }
                NodeStatus::Skipped => {
                    Resolution::Dead(self.skip_reason(source).unwrap_or(SkipReason::Branch))
                }
                _ => Resolution::Pending,
            };
        }
        if self.scope.as_deref() == Some(source) {
            return match (edge.from.port.as_str(), &self.loop_values) {
                ("item", Some((item, _))) => Resolution::Delivered(item.clone()),
                ("index", Some((_, index))) => Resolution::Delivered(index.clone()),
                _ => Resolution::Dead(SkipReason::Branch),
            };
        }
        self.external
            .get(&edge.id)
            .cloned()
            .unwrap_or(Resolution::Dead(SkipReason::Branch))
    }

    /// Resolutions of every edge entering `loop_id`'s body from this scope or beyond
    pub fn external_for(&self, plan: &RunPlan, loop_id: &str) -> HashMap<EdgeId, Resolution> {
        plan.scopes
            .body_inputs(&plan.graph, loop_id)
            .map(|e| (e.id.clone(), self.resolve(e)))
            .collect()
    }

    pub fn readiness(&self, plan: &RunPlan, node: &str) -> Readiness {
        if let Some((seed, inputs)) = &self.seed {
            if seed == node {
                return Readiness::Ready(inputs.clone());
            }
        }
        let Some(definition) = plan.definitions.get(node) else {
            return Readiness::Blocked { partial: false };
        };
        let incoming = plan.incoming(node);
        if incoming.is_empty() {
            // nothing can ever activate it
            return Readiness::Blocked { partial: false };
        }

        let mut inputs = PortValues::new();
        let mut pending = false;
        let mut partial = false;
        let mut all_dead = true;
        let mut required_dead = None;
        let mut any_dead = None;

        for port in &definition.inputs {
            let resolutions: Vec<Resolution> = incoming
                .iter()
                .filter(|e| e.to.port == port.name)
                .map(|e| self.resolve(e))
                .collect();
            if resolutions.is_empty() {
                pending |= port.required;
                continue;
            }
            partial |= resolutions
                .iter()
                .any(|r| matches!(r, Resolution::Delivered(_)));
            match combine(port.fan_in, resolutions) {
                Resolution::Delivered(value) => {
                    inputs.insert(port.name.clone(), value);
                    partial = true;
                    all_dead = false;
                }
                Resolution::Pending => {
                    pending = true;
                    all_dead = false;
                }
                Resolution::Dead(reason) => {
                    any_dead = worse(any_dead, reason);
                    if port.required {
                        required_dead = worse(required_dead, reason);
                    }
                }
            }
        }

        if let Some(reason) = required_dead {
            return Readiness::Skip(reason);
        }
        if all_dead {
            return Readiness::Skip(any_dead.unwrap_or(SkipReason::Branch));
        }
        if pending {
            return Readiness::Blocked { partial };
        }
        if plan.scopes.is_loop(node)
            && plan
                .scopes
                .body_inputs(&plan.graph, node)
                .any(|e| self.resolve(e) == Resolution::Pending)
        {
            return Readiness::Blocked { partial };
        }
        Readiness::Ready(inputs)
    }

    /// Propagate skips to a fixpoint and collect the nodes ready to dispatch
    pub fn settle(&mut self, plan: &RunPlan) -> (Vec<(NodeId, PortValues)>, Vec<Transition>) {
        let mut transitions = Vec::new();
        loop {
            let mut changed = false;
            let mut ready = Vec::new();
            for index in 0..self.members.len() {
                let node = self.members[index].clone();
                let status = self.status_of(&node);
                if !matches!(status, NodeStatus::Idle | NodeStatus::Waiting) {
                    continue;
                }
                match self.readiness(plan, &node) {
                    Readiness::Skip(reason) => {
                        self.mark_skipped(&node, reason);
                        transitions.push(Transition::Skipped(node, reason));
                        changed = true;
                    }
                    Readiness::Blocked { partial: true } if status == NodeStatus::Idle => {
                        self.status.insert(node.clone(), NodeStatus::Waiting);
                        transitions.push(Transition::Waiting(node));
                    }
                    Readiness::Blocked { .. } => {}
                    Readiness::Ready(inputs) => ready.push((node, inputs)),
                }
            }
            if !changed {
                return (ready, transitions);
            }
        }
    }

    pub fn mark_running(&mut self, node: &str) {
        self.status.insert(node.to_string(), NodeStatus::Running);
    }

    pub fn mark_skipped(&mut self, node: &str, reason: SkipReason) {
        self.status.insert(node.to_string(), NodeStatus::Skipped);
        self.skip_reasons.insert(node.to_string(), reason);
    }

    /// Publish a successful node's port values
    pub fn complete(&mut self, node: &str, outputs: &[(String, Value)]) -> Result<(), FlowError> {
        for (port, value) in outputs {
            self.context.bind(node, port, value.clone())?;
        }
        self.status.insert(node.to_string(), NodeStatus::Success);
        Ok(())
    }

    /// Record a failure; `routed` carries the error port name and payload when routed
    pub fn fail(
        &mut self,
        node: &str,
        message: String,
        routed: Option<(&str, Value)>,
    ) -> Result<(), FlowError> {
        if let Some((port, payload)) = routed {
            self.context.bind(node, port, payload)?;
            self.routed.insert(node.to_string());
        }
        self.errors.insert(node.to_string(), message);
        self.status.insert(node.to_string(), NodeStatus::Error);
        Ok(())
    }

    /// Skip everything that has not finished; used after cancellation
    pub fn cancel_remaining(&mut self) -> Vec<Transition> {
        let open: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| !self.status_of(m).is_terminal())
            .cloned()
            .collect();
        open.into_iter()
            .map(|node| {
                self.mark_skipped(&node, SkipReason::Cancelled);
                Transition::Skipped(node, SkipReason::Cancelled)
            })
            .collect()
    }
}
