mod base;
mod log;

pub use base::{EventBus, EventEmitter, EventSink, ExecutionEvent, NodeEvent, RunId};
pub use log::EventLog;
