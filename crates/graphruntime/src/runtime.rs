use crate::context::RunRecord;
use crate::executor::{ExecutionEngine, Run};
use crate::registry::ExecutorRegistry;
use futures::stream::Stream;
use graphcore::validator::{self, ValidationIssue};
use graphcore::{
    ApprovalSignal, EventBus, ExecutionEvent, FlowError, Graph, NodeId, NodeTypeRegistry,
    PortValues, RunId, RunStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Main runtime for executing graphs
pub struct GraphRuntime {
    types: Arc<NodeTypeRegistry>,
    engine: ExecutionEngine,
    event_bus: Arc<EventBus>,
    runs: Arc<RwLock<HashMap<RunId, Arc<Run>>>>,
    config: RuntimeConfig,
}

impl GraphRuntime {
    /// Create a runtime with default settings
    pub fn new(types: Arc<NodeTypeRegistry>, executors: ExecutorRegistry) -> Self {
        Self::with_config(types, executors, RuntimeConfig::default())
    }

    /// Create a runtime with custom configuration
    pub fn with_config(
        types: Arc<NodeTypeRegistry>,
        executors: ExecutorRegistry,
        config: RuntimeConfig,
    ) -> Self {
        let engine = ExecutionEngine::new(types.clone(), Arc::new(executors), &config);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            types,
            engine,
            event_bus,
            runs: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Node kinds known to this runtime
    pub fn types(&self) -> &Arc<NodeTypeRegistry> {
        &self.types
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Structural checks without running anything
    pub fn validate(&self, graph: &Graph) -> Vec<ValidationIssue> {
        validator::validate(graph, &self.types)
    }

    /// Validate and start a run. Returns as soon as the run is scheduled.
    pub async fn submit(&self, graph: Graph, inputs: PortValues) -> Result<RunId, FlowError> {
        let run = self.engine.prepare(graph, inputs, &self.event_bus)?;
        let run_id = run.id();
        {
            let mut runs = self.runs.write().await;
            if let Some(limit) = self.config.retained_runs {
                evict_finished(&mut runs, limit);
            }
            runs.insert(run_id, run.clone());
        }
        self.engine.start(run);
        Ok(run_id)
    }

    /// Drop a finished run and return its final record. Active runs are kept.
    pub async fn forget(&self, run_id: RunId) -> Result<RunRecord, FlowError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get(&run_id)
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
        if !run.status().is_terminal() {
            return Err(FlowError::RunActive(run_id.to_string()));
        }
        let record = run.snapshot();
        runs.remove(&run_id);
        tracing::debug!("Forgot run {}", run_id);
        Ok(record)
    }

    /// Submit and wait for the terminal record
    pub async fn execute(&self, graph: Graph, inputs: PortValues) -> Result<RunRecord, FlowError> {
        let run_id = self.submit(graph, inputs).await?;
        self.wait(run_id).await
    }

    async fn run(&self, run_id: RunId) -> Result<Arc<Run>, FlowError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    /// Every event of the run from its start, live until the run ends
    pub async fn events(
        &self,
        run_id: RunId,
    ) -> Result<impl Stream<Item = ExecutionEvent> + Send + 'static, FlowError> {
        Ok(self.run(run_id).await?.events())
    }

    /// Events published so far
    pub async fn event_log(&self, run_id: RunId) -> Result<Vec<ExecutionEvent>, FlowError> {
        Ok(self.run(run_id).await?.event_log())
    }

    pub async fn resume(&self, run_id: RunId, signal: ApprovalSignal) -> Result<NodeId, FlowError> {
        self.run(run_id).await?.resume(signal)
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<(), FlowError> {
        self.run(run_id).await?.cancel();
        Ok(())
    }

    pub async fn status(&self, run_id: RunId) -> Result<RunStatus, FlowError> {
        Ok(self.run(run_id).await?.status())
    }

    pub async fn snapshot(&self, run_id: RunId) -> Result<RunRecord, FlowError> {
        Ok(self.run(run_id).await?.snapshot())
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait(&self, run_id: RunId) -> Result<RunRecord, FlowError> {
        let run = self.run(run_id).await?;
        Ok(run.wait().await)
    }

    /// Nodes currently suspended on a human decision
    pub async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<NodeId>, FlowError> {
        Ok(self.run(run_id).await?.pending_approvals())
    }

    /// Known runs and their status
    pub async fn list_runs(&self) -> Vec<(RunId, RunStatus)> {
        let runs = self.runs.read().await;
        let mut listed: Vec<(RunId, RunStatus)> =
            runs.iter().map(|(id, run)| (*id, run.status())).collect();
        listed.sort_by_key(|(id, _)| *id);
        listed
    }

    /// Subscribe to events of every run
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }
}

/// Keep at most `limit` finished runs, dropping the ones that finished first
fn evict_finished(runs: &mut HashMap<RunId, Arc<Run>>, limit: usize) {
    let mut finished: Vec<(RunId, DateTime<Utc>)> = runs
        .iter()
        .filter(|(_, run)| run.status().is_terminal())
        .filter_map(|(id, run)| run.finished_at().map(|at| (*id, at)))
        .collect();
    if finished.len() <= limit {
        return;
    }
    finished.sort_by_key(|(_, at)| *at);
    let excess = finished.len() - limit;
    for (id, _) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    tracing::debug!("Evicted {} finished run(s)", excess);
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Applied to nodes without their own `timeoutMs`
    pub default_node_timeout_ms: Option<u64>,
    /// Finished runs kept for inspection; `None` keeps them all
    pub retained_runs: Option<usize>,
}

impl RuntimeConfig {
    /// Defaults overridden by `GRAPH_MAX_PARALLEL`, `GRAPH_EVENT_BUFFER`,
    /// `GRAPH_NODE_TIMEOUT_MS` and `GRAPH_RETAINED_RUNS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_number("GRAPH_MAX_PARALLEL") {
            config.max_parallel_nodes = saturating_usize(value).max(1);
        }
        if let Some(value) = env_number("GRAPH_EVENT_BUFFER") {
            config.event_buffer_size = saturating_usize(value).max(1);
        }
        if let Some(value) = env_number("GRAPH_NODE_TIMEOUT_MS") {
            config.default_node_timeout_ms = Some(value);
        }
        if let Some(value) = env_number("GRAPH_RETAINED_RUNS") {
            config.retained_runs = Some(saturating_usize(value));
        }
        config
    }

    pub fn with_max_parallel(mut self, max_parallel_nodes: usize) -> Self {
        self.max_parallel_nodes = max_parallel_nodes.max(1);
        self
    }

    pub fn with_default_timeout(mut self, ms: u64) -> Self {
        self.default_node_timeout_ms = Some(ms);
        self
    }

    pub fn with_retained_runs(mut self, limit: usize) -> Self {
        self.retained_runs = Some(limit);
        self
    }
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a non-negative integer", name, raw);
            None
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_node_timeout_ms: None,
            retained_runs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_parallelism() {
        let config = RuntimeConfig::default()
            .with_max_parallel(0)
            .with_default_timeout(250);
        assert_eq!(config.max_parallel_nodes, 1);
        assert_eq!(config.default_node_timeout_ms, Some(250));
        assert_eq!(config.event_buffer_size, 1000);
        assert_eq!(config.retained_runs, None);
    }

    #[test]
    fn oversized_counts_saturate() {
        assert_eq!(saturating_usize(u64::MAX), usize::MAX);
        assert_eq!(saturating_usize(7), 7);
    }
}
