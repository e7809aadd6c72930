use graphcore::{ApprovalSignal, FlowError, NodeId, RunId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

/// Pending human-approval waits of one run
///
/// A node inside a loop body may wait in several iterations at once; signals for
/// the same node are delivered oldest first.
pub struct ApprovalGate {
    run_id: RunId,
    waiting: Mutex<BTreeMap<NodeId, VecDeque<oneshot::Sender<ApprovalSignal>>>>,
}

impl ApprovalGate {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            waiting: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a wait for `node_id`
    pub fn register(&self, node_id: &str) -> oneshot::Receiver<ApprovalSignal> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node_id.to_string())
            .or_default()
            .push_back(tx);
        rx
    }

    /// Nodes with at least one live wait
    pub fn pending(&self) -> Vec<NodeId> {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        waiting.retain(|_, queue| {
            queue.retain(|tx| !tx.is_closed());
            !queue.is_empty()
        });
        waiting.keys().cloned().collect()
    }

    /// Deliver a signal. Returns the node that received it.
    pub fn resume(&self, signal: ApprovalSignal) -> Result<NodeId, FlowError> {
        let pending = self.pending();
        let target = match &signal.node_id {
            Some(node) if pending.contains(node) => node.clone(),
            Some(node) => {
                return Err(FlowError::NotAwaitingApproval {
                    run_id: self.run_id.to_string(),
                    node_id: Some(node.clone()),
                })
            }
            None => match pending.as_slice() {
                [only] => only.clone(),
                [] => {
                    return Err(FlowError::NotAwaitingApproval {
                        run_id: self.run_id.to_string(),
                        node_id: None,
                    })
                }
                _ => {
                    return Err(FlowError::AmbiguousApproval {
                        run_id: self.run_id.to_string(),
                        waiting: pending.clone(),
                    })
                }
            },
        };

        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = waiting.entry(target.clone()).or_default();
        let mut signal = signal;
        while let Some(tx) = queue.pop_front() {
            match tx.send(signal) {
                Ok(()) => {
                    if queue.is_empty() {
                        waiting.remove(&target);
                    }
                    return Ok(target);
                }
                // waiter went away (cancelled); try the next one
                Err(returned) => signal = returned,
            }
        }
        waiting.remove(&target);
        Err(FlowError::NotAwaitingApproval {
            run_id: self.run_id.to_string(),
            node_id: Some(target),
        })
    }
}
