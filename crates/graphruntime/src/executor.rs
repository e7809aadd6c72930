use crate::approval::ApprovalGate;
use crate::context::{RunRecord, RuntimeState};
use crate::frame::{Frame, Resolution, Transition};
use crate::plan::RunPlan;
use crate::registry::ExecutorRegistry;
use crate::runtime::RuntimeConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use graphcore::{
    topology, ApprovalSignal, Config, EdgeId, EventBus, EventEmitter, EventLog, EventSink,
    ExecutionEvent, FlowError, Graph, Invocation, NodeContext, NodeError, NodeExecutor, NodeId,
    NodeKind, NodeOutput, NodeStatus, NodeTypeRegistry, PortValues, RunId, RunServices, RunStatus,
    SkipReason, Value, ERROR_PORT, TIMEOUT_OPTION,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Prepares runs and drives them as barrier-synchronised ready-set iterations
pub struct ExecutionEngine {
    types: Arc<NodeTypeRegistry>,
    executors: Arc<ExecutorRegistry>,
    max_parallel: usize,
    default_timeout_ms: Option<u64>,
}

impl ExecutionEngine {
    pub fn new(
        types: Arc<NodeTypeRegistry>,
        executors: Arc<ExecutorRegistry>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            types,
            executors,
            max_parallel: config.max_parallel_nodes.max(1),
            default_timeout_ms: config.default_node_timeout_ms,
        }
    }

    /// Validate the graph, instantiate executors and create the run (status `pending`)
    pub fn prepare(&self, graph: Graph, inputs: PortValues, bus: &EventBus) -> Result<Arc<Run>, FlowError> {
        let plan = RunPlan::build(graph.clone(), &self.types, &self.executors)?;
        let run_id = Uuid::new_v4();
        let log = Arc::new(EventLog::new());
        let (finished, _) = watch::channel(RunStatus::Pending);

        let run = Arc::new(Run {
            run_id,
            plan,
            record: Mutex::new(RunRecord::new(run_id, graph, inputs)),
            sink: bus.sink_for(log.clone()),
            log,
            cancel: CancellationToken::new(),
            approvals: ApprovalGate::new(run_id),
            semaphore: Arc::new(Semaphore::new(self.max_parallel)),
            executors: self.executors.clone(),
            types: self.types.clone(),
            wrapped: Mutex::new(HashMap::new()),
            default_timeout_ms: self.default_timeout_ms,
            fatal: Mutex::new(None),
            held: watch::channel(0).0,
            finished,
        });
        run.sink
            .publish(ExecutionEvent::run_status(run_id, RunStatus::Pending, None));
        Ok(run)
    }

    /// Drive a prepared run to completion in the background
    pub fn start(&self, run: Arc<Run>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run.drive())
    }
}

/// Result of one dispatched node
struct Completion {
    node: NodeId,
    result: Result<NodeOutput, NodeError>,
    duration_ms: u64,
}

/// One execution of a graph
pub struct Run {
    run_id: RunId,
    plan: RunPlan,
    record: Mutex<RunRecord>,
    log: Arc<EventLog>,
    sink: EventSink,
    cancel: CancellationToken,
    approvals: ApprovalGate,
    semaphore: Arc<Semaphore>,
    executors: Arc<ExecutorRegistry>,
    types: Arc<NodeTypeRegistry>,
    /// Inner executors of wrapper nodes, per (caller, kind)
    wrapped: Mutex<HashMap<(NodeId, String), Arc<dyn NodeExecutor>>>,
    default_timeout_ms: Option<u64>,
    fatal: Mutex<Option<String>>,
    /// Approvals in flight anywhere in the run
    held: watch::Sender<usize>,
    finished: watch::Sender<RunStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn with_timeout<F>(
    execution: F,
    timeout_ms: Option<u64>,
    token: &CancellationToken,
) -> Result<NodeOutput, NodeError>
where
    F: Future<Output = Result<NodeOutput, NodeError>>,
{
    match timeout_ms {
        Some(ms) => match timeout(Duration::from_millis(ms), execution).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(NodeError::Timeout { ms })
            }
        },
        None => execution.await,
    }
}

impl Run {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.record).status
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.record).finished_at
    }

    /// Node states, bindings and graph snapshot as of now
    pub fn snapshot(&self) -> RunRecord {
        lock(&self.record).clone()
    }

    /// All events from the start of the run, live until it ends
    pub fn events(&self) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        self.log.stream()
    }

    pub fn event_log(&self) -> Vec<ExecutionEvent> {
        self.log.snapshot()
    }

    /// Request cooperative cancellation. No-op once the run has finished.
    pub fn cancel(&self) {
        if !self.status().is_terminal() {
            tracing::info!("Cancelling run {}", self.run_id);
            self.cancel.cancel();
        }
    }

    /// Deliver an approval decision. Returns the node that received it.
    pub fn resume(&self, signal: ApprovalSignal) -> Result<NodeId, FlowError> {
        let decision = signal.decision;
        let node = self.approvals.resume(signal)?;
        tracing::info!("Run {} node {} resumed with {}", self.run_id, node, decision);
        Ok(node)
    }

    pub fn pending_approvals(&self) -> Vec<NodeId> {
        self.approvals.pending()
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(&self) -> RunRecord {
        let mut rx = self.finished.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.snapshot()
    }

    async fn drive(self: Arc<Self>) {
        let started = Instant::now();
        self.set_status(RunStatus::Running, None);
        tracing::info!(
            "Starting run {} ({} nodes, {} edges)",
            self.run_id,
            self.plan.graph.nodes.len(),
            self.plan.graph.edges.len()
        );

        let inputs = lock(&self.record).inputs.clone();
        let frame = Frame::main(&self.plan, inputs, self.cancel.clone());
        let frame = self.clone().run_frame(frame).await;

        let (status, error) = self.outcome(&frame);
        self.set_status(status, error.clone());
        self.log.close();
        self.finished.send_replace(status);

        match error {
            Some(error) => tracing::warn!(
                "Run {} {} after {}ms: {}",
                self.run_id,
                status,
                started.elapsed().as_millis(),
                error
            ),
            None => tracing::info!(
                "Run {} {} after {}ms",
                self.run_id,
                status,
                started.elapsed().as_millis()
            ),
        }
    }

    fn set_status(&self, status: RunStatus, error: Option<String>) {
        {
            let mut record = lock(&self.record);
            record.status = status;
            if status.is_terminal() {
                record.finished_at = Some(Utc::now());
                record.error = error.clone();
            }
        }
        self.sink
            .publish(ExecutionEvent::run_status(self.run_id, status, error));
    }

    fn update_node(&self, node: &str, f: impl FnOnce(&mut RuntimeState)) {
        let mut record = lock(&self.record);
        if let Some(state) = record.nodes.get_mut(node) {
            f(state);
        }
    }

    /// Engine invariant violation: stop dispatching and fail the run
    fn fail_fatal(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("Invariant violated in run {}: {}", self.run_id, message);
        lock(&self.fatal).get_or_insert(message);
        self.cancel.cancel();
    }

    fn fatal(&self) -> Option<String> {
        lock(&self.fatal).clone()
    }

    /// Schedule one scope until nothing more can run
    ///
    /// A pending approval holds the whole run: nodes already dispatched finish, but no
    /// scope dispatches anything new until every approval has been answered.
    fn run_frame(self: Arc<Self>, mut frame: Frame) -> BoxFuture<'static, Frame> {
        Box::pin(async move {
            let mut suspended: FuturesUnordered<BoxFuture<'static, Completion>> =
                FuturesUnordered::new();

            loop {
                if frame.cancel.is_cancelled() {
                    break;
                }
                if !suspended.is_empty() {
                    if let Some(done) = suspended.next().await {
                        self.complete(&mut frame, done);
                    }
                    continue;
                }
                if !self.approvals_answered(&frame.cancel).await {
                    break;
                }

                let (ready, transitions) = frame.settle(&self.plan);
                self.publish_transitions(&frame, transitions);
                if ready.is_empty() {
                    break;
                }

                tracing::debug!(
                    "Run {} dispatching {} node(s): {:?}",
                    self.run_id,
                    ready.len(),
                    ready.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
                );

                let mut batch: FuturesUnordered<BoxFuture<'static, Completion>> =
                    FuturesUnordered::new();
                for (node, inputs) in ready {
                    let approval = self.plan.kind(&node) == Some(NodeKind::HumanApproval);
                    let task = self.dispatch(&mut frame, node, inputs);
                    if approval {
                        suspended.push(self.hold(task));
                    } else {
                        batch.push(task);
                    }
                }

                while !batch.is_empty() {
                    tokio::select! {
                        Some(done) = batch.next() => self.complete(&mut frame, done),
                        Some(done) = suspended.next(), if !suspended.is_empty() => {
                            self.complete(&mut frame, done)
                        }
                    }
                }
            }

            // waits observe cancellation and return
            while let Some(done) = suspended.next().await {
                self.complete(&mut frame, done);
            }
            if frame.cancel.is_cancelled() {
                let transitions = frame.cancel_remaining();
                self.publish_transitions(&frame, transitions);
            }
            frame
        })
    }

    /// Count an approval task as holding the run until it completes
    fn hold(self: &Arc<Self>, task: BoxFuture<'static, Completion>) -> BoxFuture<'static, Completion> {
        self.held.send_modify(|n| *n += 1);
        let run = self.clone();
        Box::pin(async move {
            let done = task.await;
            run.held.send_modify(|n| *n = n.saturating_sub(1));
            done
        })
    }

    /// Wait until no approval is pending in the run. False when cancelled first.
    async fn approvals_answered(&self, cancel: &CancellationToken) -> bool {
        let mut held = self.held.subscribe();
        loop {
            let pending = *held.borrow_and_update();
            if pending == 0 {
                return true;
            }
            tracing::debug!("Run {} held by {} pending approval(s)", self.run_id, pending);
            tokio::select! {
                changed = held.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }

    fn publish_transitions(&self, frame: &Frame, transitions: Vec<Transition>) {
        for transition in transitions {
            match transition {
                Transition::Waiting(node) => {
                    self.update_node(&node, |state| {
                        state.status = NodeStatus::Waiting;
                        state.iteration = frame.iteration;
                    });
                    self.sink.publish(
                        ExecutionEvent::node_status(self.run_id, node, NodeStatus::Waiting)
                            .with_iteration(frame.iteration),
                    );
                }
                Transition::Skipped(node, reason) => {
                    tracing::debug!("Run {} skipping {} ({:?})", self.run_id, node, reason);
                    self.update_node(&node, |state| {
                        *state = RuntimeState {
                            status: NodeStatus::Skipped,
                            finished_at: Some(Utc::now()),
                            skip_reason: Some(reason),
                            iteration: frame.iteration,
                            ..RuntimeState::default()
                        };
                    });
                    self.sink.publish(
                        ExecutionEvent::node_status(self.run_id, node, NodeStatus::Skipped)
                            .with_iteration(frame.iteration)
                            .with_skip_reason(reason),
                    );
                }
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: &mut Frame,
        node: NodeId,
        inputs: PortValues,
    ) -> BoxFuture<'static, Completion> {
        frame.mark_running(&node);
        let iteration = frame.iteration;
        self.update_node(&node, |state| {
            *state = RuntimeState {
                status: NodeStatus::Running,
                started_at: Some(Utc::now()),
                iteration,
                ..RuntimeState::default()
            };
        });
        self.sink.publish(
            ExecutionEvent::node_status(self.run_id, node.clone(), NodeStatus::Running)
                .with_iteration(iteration),
        );

        let missing = self.plan.definitions.get(&node).and_then(|def| {
            def.inputs
                .iter()
                .find(|p| p.required && !inputs.contains_key(&p.name))
                .map(|p| p.name.clone())
        });
        let executor = self.plan.executors.get(&node).cloned();
        let executor = match (missing, executor) {
            (None, Some(executor)) => executor,
            (Some(port), _) => {
                let message = format!("node '{}' dispatched without required input '{}'", node, port);
                self.fail_fatal(message.clone());
                return Box::pin(async move {
                    Completion {
                        node,
                        result: Err(NodeError::execution(message)),
                        duration_ms: 0,
                    }
                });
            }
            (None, None) => {
                let message = format!("node '{}' has no executor instance", node);
                self.fail_fatal(message.clone());
                return Box::pin(async move {
                    Completion {
                        node,
                        result: Err(NodeError::execution(message)),
                        duration_ms: 0,
                    }
                });
            }
        };

        let token = frame.cancel.child_token();
        let external = self
            .plan
            .scopes
            .is_loop(&node)
            .then(|| Arc::new(frame.external_for(&self.plan, &node)));
        let services = Arc::new(NodeServices {
            run: self.clone(),
            node: node.clone(),
            iteration,
            external,
            cancel: token.clone(),
        });
        let ctx = NodeContext {
            run_id: self.run_id,
            node_id: node.clone(),
            node_type: self.plan.node_type(&node).to_string(),
            inputs,
            config: self.plan.configs.get(&node).cloned().unwrap_or_default(),
            outgoing: self.plan.graph.outgoing(&node).cloned().collect(),
            iteration,
            events: EventEmitter::new(self.run_id, node.clone(), self.sink.clone()),
            cancellation: token.clone(),
            services,
        };

        let timeout_ms = self.plan.timeout_ms(&node, self.default_timeout_ms);
        let needs_permit = !self.plan.kind(&node).map_or(false, NodeKind::is_coordinator);
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            // coordinators hold no permit so their bodies can use one
            let _permit = if needs_permit {
                match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return (Err(NodeError::Cancelled { committed: false }), 0),
                }
            } else {
                None
            };
            let started = Instant::now();
            let result = with_timeout(executor.execute(ctx), timeout_ms, &token).await;
            (result, started.elapsed().as_millis() as u64)
        });

        Box::pin(async move {
            match handle.await {
                Ok((result, duration_ms)) => Completion {
                    node,
                    result,
                    duration_ms,
                },
                Err(e) => Completion {
                    node,
                    result: Err(NodeError::execution(format!("executor task failed: {}", e))),
                    duration_ms: 0,
                },
            }
        })
    }

    /// Reject values on ports the node's definition does not declare
    fn check_ports(&self, node: &str, output: NodeOutput) -> Result<NodeOutput, NodeError> {
        if let Some(def) = self.plan.definitions.get(node) {
            if let Some(port) = output.outputs.keys().find(|p| def.output(p).is_none()) {
                return Err(NodeError::execution(format!(
                    "executor emitted undeclared output port '{}'",
                    port
                )));
            }
        }
        Ok(output)
    }

    fn routes_errors(&self, node: &str) -> bool {
        self.plan
            .definitions
            .get(node)
            .map_or(false, |def| def.has_error_port())
            && self.plan.graph.outgoing(node).any(|e| e.from.port == ERROR_PORT)
    }

    fn complete(&self, frame: &mut Frame, done: Completion) {
        let Completion {
            node,
            result,
            duration_ms,
        } = done;
        let iteration = frame.iteration;

        match result.and_then(|output| self.check_ports(&node, output)) {
            Ok(output) => {
                let mut outputs: Vec<(String, Value)> = output.outputs.into_iter().collect();
                outputs.sort_by(|a, b| a.0.cmp(&b.0));
                if let Err(e) = self.publish_outputs(frame, &node, &outputs) {
                    self.fail_fatal(e.to_string());
                }

                let mut metrics = output.metrics;
                metrics.duration_ms = duration_ms;
                let attempts = metrics.attempts.unwrap_or(1);
                let values: BTreeMap<String, Value> = outputs.iter().cloned().collect();
                let event_output = Value::Object(outputs.into_iter().collect());

                self.update_node(&node, |state| {
                    state.status = NodeStatus::Success;
                    state.finished_at = Some(Utc::now());
                    state.output = Some(values);
                    state.attempts = attempts;
                    state.metrics = metrics;
                });
                self.sink.publish(
                    ExecutionEvent::node_status(self.run_id, node.clone(), NodeStatus::Success)
                        .with_iteration(iteration)
                        .with_output(event_output),
                );
                tracing::info!("Node {} completed in {}ms", node, duration_ms);
            }
            Err(NodeError::Cancelled { committed: false }) => {
                frame.mark_skipped(&node, SkipReason::Cancelled);
                self.update_node(&node, |state| {
                    state.status = NodeStatus::Skipped;
                    state.finished_at = Some(Utc::now());
                    state.skip_reason = Some(SkipReason::Cancelled);
                    state.metrics.duration_ms = duration_ms;
                });
                self.sink.publish(
                    ExecutionEvent::node_status(self.run_id, node.clone(), NodeStatus::Skipped)
                        .with_iteration(iteration)
                        .with_skip_reason(SkipReason::Cancelled),
                );
                tracing::info!("Node {} cancelled", node);
            }
            Err(error) => {
                let message = error.to_string();
                let attempts = error.attempts();
                let payload = self
                    .routes_errors(&node)
                    .then(|| json!({"message": message, "nodeId": node, "attempts": attempts}));

                if let Err(e) = frame.fail(
                    &node,
                    message.clone(),
                    payload.clone().map(|p| (ERROR_PORT, p)),
                ) {
                    self.fail_fatal(e.to_string());
                }
                if let (true, Some(payload)) = (frame.is_main(), &payload) {
                    if let Err(e) = lock(&self.record).context.bind(&node, ERROR_PORT, payload.clone()) {
                        self.fail_fatal(e.to_string());
                    }
                }

                self.update_node(&node, |state| {
                    state.status = NodeStatus::Error;
                    state.finished_at = Some(Utc::now());
                    state.error = Some(message.clone());
                    state.attempts = attempts;
                    state.metrics.duration_ms = duration_ms;
                    state.output = payload
                        .clone()
                        .map(|p| BTreeMap::from([(ERROR_PORT.to_string(), p)]));
                });
                let mut event =
                    ExecutionEvent::node_status(self.run_id, node.clone(), NodeStatus::Error)
                        .with_iteration(iteration)
                        .with_error(message.clone());
                if let Some(payload) = payload {
                    event = event.with_output(json!({ ERROR_PORT: payload }));
                }
                self.sink.publish(event);
                tracing::error!("Node {} failed: {}", node, message);
            }
        }
    }

    fn publish_outputs(
        &self,
        frame: &mut Frame,
        node: &str,
        outputs: &[(String, Value)],
    ) -> Result<(), FlowError> {
        frame.complete(node, outputs)?;
        if frame.is_main() {
            let mut record = lock(&self.record);
            for (port, value) in outputs {
                record.context.bind(node, port, value.clone())?;
            }
        }
        Ok(())
    }

    fn outcome(&self, frame: &Frame) -> (RunStatus, Option<String>) {
        if let Some(fatal) = self.fatal() {
            return (RunStatus::Failed, Some(format!("invariant violated: {}", fatal)));
        }
        if self.cancel.is_cancelled() {
            return (RunStatus::Cancelled, None);
        }

        let reachable = topology::reachable_from(&self.plan.graph, &self.plan.start, |e| {
            !self.plan.scopes.is_back_edge(e)
        });
        let required = self
            .plan
            .graph
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|node| self.plan.is_required_output(node));
        for node in required {
            let problem = if !frame.is_member(node) {
                Some("is not in the run's top-level scope")
            } else {
                match frame.status_of(node) {
                    NodeStatus::Success => None,
                    NodeStatus::Error => Some("failed"),
                    NodeStatus::Skipped => frame
                        .skip_reason(node)
                        .filter(|reason| reason.fails_terminal())
                        .map(|_| "was skipped after an upstream failure"),
                    _ if reachable.contains(node) => Some("never received a value"),
                    _ => None,
                }
            };
            if let Some(problem) = problem {
                return (RunStatus::Failed, Some(format!("output '{}' {}", node, problem)));
            }
        }
        (RunStatus::Succeeded, None)
    }

    /// One loop iteration: run the body scope and read its feedback value
    async fn run_iteration(
        self: Arc<Self>,
        loop_id: &str,
        item: Value,
        index: u32,
        external: Arc<HashMap<EdgeId, Resolution>>,
        cancellation: CancellationToken,
    ) -> Result<Value, NodeError> {
        let frame = Frame::body(&self.plan, loop_id, index, item.clone(), external, cancellation);
        let frame = self.clone().run_frame(frame).await;

        if frame.cancel.is_cancelled() {
            return Err(NodeError::Cancelled { committed: false });
        }
        if let Some((node, message)) = frame.first_failure() {
            return Err(NodeError::execution(format!(
                "iteration {} failed at '{}': {}",
                index, node, message
            )));
        }

        let mut feedback = self
            .plan
            .graph
            .incoming(loop_id)
            .filter(|e| self.plan.scopes.is_back_edge(e))
            .peekable();
        if feedback.peek().is_none() {
            return Ok(item);
        }
        Ok(feedback
            .find_map(|e| match frame.resolve(e) {
                Resolution::Delivered(value) => Some(value),
                _ => None,
            })
            .unwrap_or(Value::Null))
    }

    fn wrapped_executor(
        &self,
        caller: &str,
        node_type: &str,
        config: &Config,
    ) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        let key = (caller.to_string(), node_type.to_string());
        if let Some(existing) = lock(&self.wrapped).get(&key) {
            return Ok(existing.clone());
        }
        let executor = self
            .executors
            .create(node_type, config)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        Ok(lock(&self.wrapped).entry(key).or_insert(executor).clone())
    }

    async fn await_approval(
        &self,
        node: &str,
        iteration: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalSignal, NodeError> {
        let rx = self.approvals.register(node);
        self.update_node(node, |state| state.status = NodeStatus::Waiting);
        self.sink.publish(
            ExecutionEvent::node_status(self.run_id, node, NodeStatus::Waiting).with_iteration(iteration),
        );
        tracing::info!("Run {} node {} awaiting approval", self.run_id, node);

        let signal = tokio::select! {
            signal = rx => signal.map_err(|_| NodeError::Cancelled { committed: false })?,
            _ = cancel.cancelled() => return Err(NodeError::Cancelled { committed: false }),
        };

        self.update_node(node, |state| state.status = NodeStatus::Running);
        self.sink.publish(
            ExecutionEvent::node_status(self.run_id, node, NodeStatus::Running).with_iteration(iteration),
        );
        Ok(signal)
    }
}

/// Engine services handed to one dispatched node
struct NodeServices {
    run: Arc<Run>,
    node: NodeId,
    iteration: Option<u32>,
    /// Present for loop nodes: resolutions of edges entering the body
    external: Option<Arc<HashMap<EdgeId, Resolution>>>,
    cancel: CancellationToken,
}

#[async_trait]
impl RunServices for NodeServices {
    async fn invoke(&self, invocation: Invocation) -> Result<NodeOutput, NodeError> {
        let Invocation {
            caller,
            node_type,
            config,
            inputs,
            cancellation,
        } = invocation;
        let run = &self.run;

        let config = match run.types.get(&node_type) {
            Ok(def) => def.effective_config(&config),
            Err(_) => config,
        };
        let executor = run.wrapped_executor(&caller, &node_type, &config)?;
        let timeout_ms = config
            .get(TIMEOUT_OPTION)
            .and_then(Value::as_u64)
            .or(run.default_timeout_ms);

        let services = Arc::new(NodeServices {
            run: run.clone(),
            node: caller.clone(),
            iteration: self.iteration,
            external: None,
            cancel: cancellation.clone(),
        });
        let ctx = NodeContext {
            run_id: run.run_id,
            node_id: caller.clone(),
            node_type,
            inputs,
            config,
            outgoing: Vec::new(),
            iteration: self.iteration,
            events: EventEmitter::new(run.run_id, caller, run.sink.clone()),
            cancellation: cancellation.clone(),
            services,
        };
        with_timeout(executor.execute(ctx), timeout_ms, &cancellation).await
    }

    async fn run_body(
        &self,
        loop_node: &str,
        item: Value,
        index: u32,
        cancellation: CancellationToken,
    ) -> Result<Value, NodeError> {
        match &self.external {
            Some(external) if loop_node == self.node => {
                self.run
                    .clone()
                    .run_iteration(loop_node, item, index, external.clone(), cancellation)
                    .await
            }
            _ => Err(NodeError::execution(format!(
                "'{}' is not a loop being executed by this node",
                loop_node
            ))),
        }
    }

    async fn await_approval(&self, node_id: &str) -> Result<ApprovalSignal, NodeError> {
        self.run
            .await_approval(node_id, self.iteration, &self.cancel)
            .await
    }
}
