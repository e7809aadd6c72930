use super::log::EventLog;
use crate::graph::NodeId;
use crate::state::{NodeStatus, RunStatus, SkipReason};
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    RunStatus {
        run_id: RunId,
        status: RunStatus,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NodeStatus {
        run_id: RunId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
    },
    #[serde(rename_all = "camelCase")]
    NodeEvent {
        run_id: RunId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn run_status(run_id: RunId, status: RunStatus, error: Option<String>) -> Self {
        ExecutionEvent::RunStatus {
            run_id,
            status,
            timestamp: Utc::now(),
            error,
        }
    }

    /// Status change with no payload; use the builder methods to attach one
    pub fn node_status(run_id: RunId, node_id: impl Into<NodeId>, status: NodeStatus) -> Self {
        ExecutionEvent::NodeStatus {
            run_id,
            node_id: node_id.into(),
            status,
            timestamp: Utc::now(),
            iteration: None,
            output: None,
            error: None,
            skip_reason: None,
        }
    }

    pub fn with_iteration(mut self, value: Option<u32>) -> Self {
        if let ExecutionEvent::NodeStatus { iteration, .. } = &mut self {
            *iteration = value;
        }
        self
    }

    pub fn with_output(mut self, value: Value) -> Self {
        if let ExecutionEvent::NodeStatus { output, .. } = &mut self {
            *output = Some(value);
        }
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        match &mut self {
            ExecutionEvent::NodeStatus { error, .. } | ExecutionEvent::RunStatus { error, .. } => {
                *error = Some(message.into());
            }
            ExecutionEvent::NodeEvent { .. } => {}
        }
        self
    }

    pub fn with_skip_reason(mut self, reason: SkipReason) -> Self {
        if let ExecutionEvent::NodeStatus { skip_reason, .. } = &mut self {
            *skip_reason = Some(reason);
        }
        self
    }

    pub fn run_id(&self) -> RunId {
        match self {
            ExecutionEvent::RunStatus { run_id, .. }
            | ExecutionEvent::NodeStatus { run_id, .. }
            | ExecutionEvent::NodeEvent { run_id, .. } => *run_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::RunStatus { .. } => None,
            ExecutionEvent::NodeStatus { node_id, .. } | ExecutionEvent::NodeEvent { node_id, .. } => {
                Some(node_id)
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExecutionEvent::RunStatus { timestamp, .. }
            | ExecutionEvent::NodeStatus { timestamp, .. }
            | ExecutionEvent::NodeEvent { timestamp, .. } => *timestamp,
        }
    }

    /// Final run status event
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::RunStatus { status, .. } if status.is_terminal())
    }
}

/// Free-form events emitted by executors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { port: String, value: Value },
}

/// Destination of a run's events: its replay log and the global bus
#[derive(Clone, Default)]
pub struct EventSink {
    log: Option<Arc<EventLog>>,
    bus: Option<broadcast::Sender<ExecutionEvent>>,
}

impl EventSink {
    pub fn new(log: Arc<EventLog>, bus: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            log: Some(log),
            bus: Some(bus),
        }
    }

    /// Sink that drops everything
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        if let Some(bus) = &self.bus {
            // no subscribers is fine
            let _ = bus.send(event.clone());
        }
        if let Some(log) = &self.log {
            log.push(event);
        }
    }
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    node_id: NodeId,
    sink: EventSink,
}

impl EventEmitter {
    pub fn new(run_id: RunId, node_id: NodeId, sink: EventSink) -> Self {
        Self {
            run_id,
            node_id,
            sink,
        }
    }

    pub fn detached(node_id: NodeId) -> Self {
        Self::new(Uuid::nil(), node_id, EventSink::detached())
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        self.sink.publish(ExecutionEvent::NodeEvent {
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }

    /// Emit data on a specific port (for streaming)
    pub fn data(&self, port: impl Into<String>, value: Value) {
        self.emit(NodeEvent::Data {
            port: port.into(),
            value,
        });
    }
}

/// Global event bus across all runs
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ExecutionEvent> {
        self.sender.clone()
    }

    /// Sink feeding both this bus and a run's log
    pub fn sink_for(&self, log: Arc<EventLog>) -> EventSink {
        EventSink::new(log, self.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_status_wire_shape() {
        let run_id = Uuid::nil();
        let event = ExecutionEvent::node_status(run_id, "check", NodeStatus::Skipped)
            .with_skip_reason(SkipReason::Branch);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("nodeStatus"));
        assert_eq!(value["nodeId"], json!("check"));
        assert_eq!(value["status"], json!("skipped"));
        assert_eq!(value["skipReason"], json!("branch"));
        assert!(value.get("output").is_none());
    }

    #[tokio::test]
    async fn emitter_reaches_bus_and_log() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let log = Arc::new(EventLog::new());
        let emitter = EventEmitter::new(Uuid::nil(), "n1".into(), bus.sink_for(log.clone()));

        emitter.info("hello");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.node_id(), Some("n1"));
        assert_eq!(log.snapshot(), vec![received]);
    }
}
