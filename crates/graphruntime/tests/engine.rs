use async_trait::async_trait;
use futures::StreamExt;
use graphcore::{
    category, ApprovalSignal, ConfigType, DataType, Decision, ExecutionEvent, FanIn, FlowError,
    Graph, NodeContext, NodeDefinition, NodeError, NodeExecutor, NodeOutput, NodeStatus,
    NodeTypeRegistry, Port, PortValues, RunStatus, SkipReason, Value,
};
use graphruntime::{ExecutorRegistry, GraphRuntime, RunRecord, RuntimeConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn definitions() -> Vec<NodeDefinition> {
    let any = DataType::Any;
    vec![
        NodeDefinition::new("input", category::IO).with_output(Port::output("output", DataType::Object)),
        NodeDefinition::new("output", category::IO)
            .with_input(Port::input("input", any).required())
            .with_output(Port::output("output", any))
            .with_option("required", ConfigType::Boolean, json!(true)),
        NodeDefinition::new("tool", category::AGENTS)
            .with_input(Port::input("input", any).required())
            .with_input(Port::input("context", any))
            .with_output(Port::output("output", any))
            .with_output(Port::output("error", DataType::Object))
            .with_option("fail", ConfigType::Boolean, json!(false))
            .with_option("sleepMs", ConfigType::Number, Value::Null)
            .with_option("commitOnCancel", ConfigType::Boolean, json!(false)),
        NodeDefinition::new("condition", category::CONTROL)
            .with_input(Port::input("input", any).required())
            .with_output(Port::output("true", any))
            .with_output(Port::output("false", any)),
        NodeDefinition::new("join", category::CONTROL)
            .with_input(Port::input("inputs", any).required().with_fan_in(FanIn::All))
            .with_output(Port::output("output", DataType::Array)),
        NodeDefinition::new("loop", category::CONTROL)
            .with_input(Port::input("items", DataType::Array).required())
            .with_input(Port::input("feedback", any))
            .with_output(Port::output("item", any))
            .with_output(Port::output("index", DataType::Number))
            .with_output(Port::output("complete", DataType::Array)),
        NodeDefinition::new("human-approval", category::GOVERNANCE)
            .with_input(Port::input("input", any).required())
            .with_output(Port::output("approved", any))
            .with_output(Port::output("rejected", any)),
    ]
}

struct Passthrough(&'static str);

#[async_trait]
impl NodeExecutor for Passthrough {
    fn node_type(&self) -> &str {
        self.0
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        match self.0 {
            "input" => Ok(NodeOutput::new().with_output("output", Value::Object(ctx.inputs.into_iter().collect()))),
            "join" => Ok(NodeOutput::new().with_output("output", ctx.require_input("inputs")?.clone())),
            _ => Ok(NodeOutput::new().with_output("output", ctx.require_input("input")?.clone())),
        }
    }
}

/// Echoes its input, optionally after a cancellable sleep or by failing
#[derive(Default)]
struct Tool {
    calls: AtomicUsize,
}

#[async_trait]
impl NodeExecutor for Tool {
    fn node_type(&self) -> &str {
        "tool"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = ctx.config.get("sleepMs").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancellation.cancelled() => {
                    let committed = ctx.config.get("commitOnCancel").and_then(Value::as_bool).unwrap_or(false);
                    return Err(NodeError::Cancelled { committed });
                }
            }
        }
        if ctx.config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(NodeError::execution(format!("{} exploded", ctx.node_id)));
        }
        let input = ctx.require_input("input")?.clone();
        let output = match ctx.inputs.get("context") {
            Some(context) => json!({"input": input, "context": context}),
            None => input,
        };
        Ok(NodeOutput::new().with_output("output", output))
    }
}

/// `true` when the input's `x` exceeds 5
struct Threshold;

#[async_trait]
impl NodeExecutor for Threshold {
    fn node_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let port = if input["x"].as_f64().unwrap_or(0.0) > 5.0 { "true" } else { "false" };
        Ok(NodeOutput::new().with_output(port, input))
    }
}

/// Runs the body once per item, sequentially
struct Sequential;

#[async_trait]
impl NodeExecutor for Sequential {
    fn node_type(&self) -> &str {
        "loop"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = ctx.require_input("items")?.as_array().cloned().unwrap_or_default();
        let mut results = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let result = ctx
                .services
                .run_body(&ctx.node_id, item, index as u32, ctx.cancellation.child_token())
                .await?;
            results.push(result);
        }
        Ok(NodeOutput::new().with_output("complete", Value::Array(results)))
    }
}

struct Approval;

#[async_trait]
impl NodeExecutor for Approval {
    fn node_type(&self) -> &str {
        "human-approval"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let signal = ctx.services.await_approval(&ctx.node_id).await?;
        let port = match signal.decision {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        };
        Ok(NodeOutput::new().with_output(port, input))
    }
}

struct Harness {
    runtime: GraphRuntime,
    tool: Arc<Tool>,
}

fn harness_with(config: RuntimeConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut types = NodeTypeRegistry::new();
    for def in definitions() {
        types.register(def).unwrap();
    }
    let tool = Arc::new(Tool::default());
    let mut executors = ExecutorRegistry::new();
    executors.register_shared(Arc::new(Passthrough("input")));
    executors.register_shared(Arc::new(Passthrough("output")));
    executors.register_shared(Arc::new(Passthrough("join")));
    executors.register_shared(tool.clone());
    executors.register_shared(Arc::new(Threshold));
    executors.register_shared(Arc::new(Sequential));
    executors.register_shared(Arc::new(Approval));

    Harness {
        runtime: GraphRuntime::with_config(Arc::new(types), executors, config),
        tool,
    }
}

fn harness() -> Harness {
    harness_with(RuntimeConfig::default())
}

fn edge(id: &str, from: &str, from_port: &str, to: &str, to_port: &str) -> Value {
    json!({"id": id, "from": {"node": from, "port": from_port}, "to": {"node": to, "port": to_port}})
}

fn graph(value: Value) -> Graph {
    serde_json::from_value(value).unwrap()
}

fn inputs(value: Value) -> PortValues {
    serde_json::from_value(value).unwrap()
}

fn status(record: &RunRecord, node: &str) -> NodeStatus {
    record.node_status(node).unwrap()
}

fn branching() -> Graph {
    graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "check", "type": "condition"},
            {"id": "hi", "type": "output"},
            {"id": "lo", "type": "output", "config": {"required": false}}
        ],
        "edges": [
            edge("e1", "in", "output", "check", "input"),
            edge("e2", "check", "true", "hi", "input"),
            edge("e3", "check", "false", "lo", "input")
        ]
    }))
}

#[tokio::test]
async fn untaken_branch_is_skipped() {
    let h = harness();
    let record = h.runtime.execute(branching(), inputs(json!({"x": 10}))).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(status(&record, "hi"), NodeStatus::Success);
    assert_eq!(status(&record, "lo"), NodeStatus::Skipped);
    assert_eq!(record.node("lo").unwrap().skip_reason, Some(SkipReason::Branch));
    assert_eq!(record.outputs().get("hi"), Some(&json!({"x": 10})));
}

fn fan_out(fail_b: bool) -> Graph {
    graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "a", "type": "tool"},
            {"id": "b", "type": "tool", "config": {"fail": fail_b}},
            {"id": "j", "type": "join"},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "a", "input"),
            edge("e2", "in", "output", "b", "input"),
            edge("e3", "a", "output", "j", "inputs"),
            edge("e4", "b", "output", "j", "inputs"),
            edge("e5", "j", "output", "out", "input")
        ]
    }))
}

#[tokio::test]
async fn join_collects_every_branch_in_edge_order() {
    let h = harness();
    let record = h.runtime.execute(fan_out(false), inputs(json!({"v": 1}))).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.context.get("j", "output"), Some(&json!([{"v": 1}, {"v": 1}])));
    assert_eq!(h.tool.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_branch_keeps_join_from_activating() {
    let h = harness();
    let record = h.runtime.execute(fan_out(true), inputs(json!({}))).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(status(&record, "b"), NodeStatus::Error);
    assert_eq!(status(&record, "j"), NodeStatus::Skipped);
    assert_eq!(record.node("j").unwrap().skip_reason, Some(SkipReason::UpstreamFailure));
    assert_eq!(record.node("b").unwrap().error.as_deref(), Some("Execution failed: b exploded"));
    assert!(record.error.unwrap().contains("out"));
}

#[tokio::test]
async fn routed_error_feeds_the_error_path() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "call", "type": "tool", "config": {"fail": true}},
            {"id": "ok", "type": "output", "config": {"required": false}},
            {"id": "fallback", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "call", "input"),
            edge("e2", "call", "output", "ok", "input"),
            edge("e3", "call", "error", "fallback", "input")
        ]
    }));
    let record = h.runtime.execute(g, inputs(json!({}))).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(status(&record, "call"), NodeStatus::Error);
    assert_eq!(record.node("ok").unwrap().skip_reason, Some(SkipReason::Branch));
    let payload = record.context.get("fallback", "output").unwrap();
    assert_eq!(payload["nodeId"], json!("call"));
    assert_eq!(payload["attempts"], json!(1));
}

#[tokio::test]
async fn invalid_graph_is_rejected_at_submit() {
    let h = harness();
    let g = graph(json!({
        "nodes": [{"id": "in", "type": "input"}, {"id": "out", "type": "output"}],
        "edges": []
    }));
    match h.runtime.submit(g, PortValues::new()).await {
        Err(FlowError::Validation(issues)) => {
            assert!(issues.iter().any(|i| i.is_error() && i.node_id.as_deref() == Some("out")))
        }
        other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn approval_suspends_until_resumed() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "review", "type": "human-approval"},
            {"id": "ship", "type": "output"},
            {"id": "drop", "type": "output", "config": {"required": false}}
        ],
        "edges": [
            edge("e1", "in", "output", "review", "input"),
            edge("e2", "review", "approved", "ship", "input"),
            edge("e3", "review", "rejected", "drop", "input")
        ]
    }));
    let run_id = h.runtime.submit(g, inputs(json!({"doc": 7}))).await.unwrap();

    let mut waited = 0;
    while h.runtime.pending_approvals(run_id).await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
        assert!(waited < 400, "approval never became pending");
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.runtime.status(run_id).await.unwrap(), RunStatus::Running);
    let snapshot = h.runtime.snapshot(run_id).await.unwrap();
    assert_eq!(snapshot.waiting_nodes(), vec!["review".to_string()]);

    let node = h.runtime.resume(run_id, ApprovalSignal::approve()).await.unwrap();
    assert_eq!(node, "review");

    let record = h.runtime.wait(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(status(&record, "ship"), NodeStatus::Success);
    assert_eq!(status(&record, "drop"), NodeStatus::Skipped);
    assert!(h.runtime.pending_approvals(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn approval_holds_every_branch_until_resumed() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "review", "type": "human-approval"},
            {"id": "ship", "type": "output"},
            {"id": "drop", "type": "output", "config": {"required": false}},
            {"id": "a", "type": "tool"},
            {"id": "b", "type": "tool"},
            {"id": "side", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "review", "input"),
            edge("e2", "review", "approved", "ship", "input"),
            edge("e3", "review", "rejected", "drop", "input"),
            edge("e4", "in", "output", "a", "input"),
            edge("e5", "a", "output", "b", "input"),
            edge("e6", "b", "output", "side", "input")
        ]
    }));
    let run_id = h.runtime.submit(g, inputs(json!({"doc": 7}))).await.unwrap();

    let mut waited = 0;
    while h.runtime.pending_approvals(run_id).await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
        assert!(waited < 400, "approval never became pending");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // `a` was dispatched alongside the approval; `b` must wait for the answer
    assert_eq!(h.tool.calls.load(Ordering::SeqCst), 1);
    let snapshot = h.runtime.snapshot(run_id).await.unwrap();
    assert_eq!(snapshot.node_status("a"), Some(NodeStatus::Success));
    assert_eq!(snapshot.node_status("b"), Some(NodeStatus::Idle));

    h.runtime.resume(run_id, ApprovalSignal::approve()).await.unwrap();
    let record = h.runtime.wait(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(h.tool.calls.load(Ordering::SeqCst), 2);
    assert_eq!(status(&record, "side"), NodeStatus::Success);
    assert_eq!(status(&record, "ship"), NodeStatus::Success);
}

#[tokio::test]
async fn resume_without_waiting_node_fails() {
    let h = harness();
    let record = h.runtime.execute(branching(), inputs(json!({"x": 1}))).await.unwrap();
    let err = h.runtime.resume(record.run_id, ApprovalSignal::approve()).await.unwrap_err();
    assert!(matches!(err, FlowError::NotAwaitingApproval { .. }));
}

#[tokio::test]
async fn cancellation_skips_in_flight_and_pending_nodes() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "slow", "type": "tool", "config": {"sleepMs": 10000}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "slow", "input"),
            edge("e2", "slow", "output", "out", "input")
        ]
    }));
    let run_id = h.runtime.submit(g, inputs(json!({}))).await.unwrap();
    while h.tool.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.runtime.cancel(run_id).await.unwrap();

    let record = h.runtime.wait(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(record.node("slow").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(record.node("out").unwrap().skip_reason, Some(SkipReason::Cancelled));
}

#[tokio::test]
async fn committed_cancellation_is_an_error() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "slow", "type": "tool", "config": {"sleepMs": 10000, "commitOnCancel": true}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "slow", "input"),
            edge("e2", "slow", "output", "out", "input")
        ]
    }));
    let run_id = h.runtime.submit(g, inputs(json!({}))).await.unwrap();
    while h.tool.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.runtime.cancel(run_id).await.unwrap();

    let record = h.runtime.wait(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(status(&record, "slow"), NodeStatus::Error);
    assert_eq!(record.node("slow").unwrap().skip_reason, None);
    assert_eq!(record.node("out").unwrap().skip_reason, Some(SkipReason::Cancelled));
}

#[tokio::test]
async fn timeout_fails_the_node() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "slow", "type": "tool", "config": {"sleepMs": 5000, "timeoutMs": 20}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "slow", "input"),
            edge("e2", "slow", "output", "out", "input")
        ]
    }));
    let record = h.runtime.execute(g, inputs(json!({}))).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(status(&record, "slow"), NodeStatus::Error);
    assert!(record.node("slow").unwrap().error.as_deref().unwrap().contains("20ms"));
}

#[tokio::test]
async fn default_timeout_comes_from_config() {
    let h = harness_with(RuntimeConfig::default().with_default_timeout(20));
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "slow", "type": "tool", "config": {"sleepMs": 5000}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "slow", "input"),
            edge("e2", "slow", "output", "out", "input")
        ]
    }));
    let record = h.runtime.execute(g, inputs(json!({}))).await.unwrap();
    assert_eq!(status(&record, "slow"), NodeStatus::Error);
}

fn looping(with_feedback: bool) -> Graph {
    let mut edges = vec![
        edge("e1", "in", "items", "each", "items"),
        edge("e2", "each", "item", "work", "input"),
        edge("e3", "in", "tag", "work", "context"),
        edge("e5", "each", "complete", "out", "input"),
    ];
    if with_feedback {
        edges.push(edge("e4", "work", "output", "each", "feedback"));
    }
    graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "each", "type": "loop"},
            {"id": "work", "type": "tool"},
            {"id": "out", "type": "output"}
        ],
        "edges": edges
    }))
}

#[tokio::test]
async fn required_output_fed_from_a_loop_body_is_rejected() {
    let h = loop_harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "each", "type": "loop"},
            {"id": "work", "type": "tool"},
            {"id": "last", "type": "output"},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "items", "each", "items"),
            edge("e2", "each", "item", "work", "input"),
            edge("e3", "work", "output", "last", "input"),
            edge("e4", "each", "complete", "out", "input")
        ]
    }));
    match h.runtime.submit(g, inputs(json!({"items": [1, 2]}))).await {
        Err(FlowError::Validation(issues)) => {
            assert!(issues.iter().any(|i| i.is_error() && i.edge_id.as_deref() == Some("e3")))
        }
        other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
    }
}

fn loop_harness() -> Harness {
    let mut types = NodeTypeRegistry::new();
    for def in definitions() {
        let def = if def.node_type == "input" { def.with_dynamic_outputs() } else { def };
        types.register(def).unwrap();
    }
    let tool = Arc::new(Tool::default());
    let mut executors = ExecutorRegistry::new();
    executors.register_shared(Arc::new(Spread));
    executors.register_shared(Arc::new(Passthrough("output")));
    executors.register_shared(tool.clone());
    executors.register_shared(Arc::new(Sequential));

    Harness {
        runtime: GraphRuntime::new(Arc::new(types), executors),
        tool,
    }
}

#[tokio::test]
async fn loop_results_come_from_feedback() {
    let h = loop_harness();
    let record = h
        .runtime
        .execute(looping(true), inputs(json!({"items": ["a", "b", "c"], "tag": "t"})))
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded, "{:?}", record.error);
    assert_eq!(h.tool.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        record.context.get("out", "output"),
        Some(&json!([
            {"input": "a", "context": "t"},
            {"input": "b", "context": "t"},
            {"input": "c", "context": "t"}
        ]))
    );
    let work = record.node("work").unwrap();
    assert_eq!(work.iteration, Some(2));
    // body bindings stay in their iteration scope
    assert!(!record.context.is_bound("work", "output"));
}

#[tokio::test]
async fn loop_without_feedback_yields_items() {
    let h = loop_harness();
    let record = h
        .runtime
        .execute(looping(false), inputs(json!({"items": [1, 2], "tag": "t"})))
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded, "{:?}", record.error);
    assert_eq!(h.tool.calls.load(Ordering::SeqCst), 2);
    assert_eq!(record.context.get("out", "output"), Some(&json!([1, 2])));
}

/// Start node that publishes each run input on its own port
struct Spread;

#[async_trait]
impl NodeExecutor for Spread {
    fn node_type(&self) -> &str {
        "input"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(ctx
            .inputs
            .into_iter()
            .fold(NodeOutput::new(), |out, (port, value)| out.with_output(port, value)))
    }
}

#[tokio::test]
async fn events_replay_from_the_start() {
    let h = harness();
    let run_id = h.runtime.submit(branching(), inputs(json!({"x": 9}))).await.unwrap();
    h.runtime.wait(run_id).await.unwrap();

    let events: Vec<ExecutionEvent> = h.runtime.events(run_id).await.unwrap().collect().await;
    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStatus { status: RunStatus::Pending, .. })
    ));
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events, h.runtime.event_log(run_id).await.unwrap());

    let running = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::NodeStatus { node_id, status: NodeStatus::Running, .. } if node_id == "hi"))
        .unwrap();
    let succeeded = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::NodeStatus { node_id, status: NodeStatus::Success, .. } if node_id == "hi"))
        .unwrap();
    assert!(running < succeeded);
}

#[tokio::test]
async fn repeated_runs_produce_the_same_outcome() {
    let h = harness();
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let record = h.runtime.execute(fan_out(false), inputs(json!({"n": 3}))).await.unwrap();
        let statuses: Vec<(String, NodeStatus)> =
            record.nodes.iter().map(|(id, s)| (id.clone(), s.status)).collect();
        outcomes.push((record.status, statuses, record.context));
    }
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn parallelism_is_bounded() {
    let h = harness_with(RuntimeConfig::default().with_max_parallel(1));
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "a", "type": "tool", "config": {"sleepMs": 40}},
            {"id": "b", "type": "tool", "config": {"sleepMs": 40}},
            {"id": "j", "type": "join"},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "a", "input"),
            edge("e2", "in", "output", "b", "input"),
            edge("e3", "a", "output", "j", "inputs"),
            edge("e4", "b", "output", "j", "inputs"),
            edge("e5", "j", "output", "out", "input")
        ]
    }));
    let started = std::time::Instant::now();
    let record = h.runtime.execute(g, inputs(json!({}))).await.unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn finished_runs_can_be_forgotten() {
    let h = harness();
    let g = graph(json!({
        "nodes": [
            {"id": "in", "type": "input"},
            {"id": "slow", "type": "tool", "config": {"sleepMs": 10000}},
            {"id": "out", "type": "output"}
        ],
        "edges": [
            edge("e1", "in", "output", "slow", "input"),
            edge("e2", "slow", "output", "out", "input")
        ]
    }));
    let run_id = h.runtime.submit(g, inputs(json!({}))).await.unwrap();
    let err = h.runtime.forget(run_id).await.unwrap_err();
    assert!(matches!(err, FlowError::RunActive(_)));

    h.runtime.cancel(run_id).await.unwrap();
    h.runtime.wait(run_id).await.unwrap();
    let record = h.runtime.forget(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(matches!(h.runtime.status(run_id).await, Err(FlowError::RunNotFound(_))));
    assert!(h.runtime.list_runs().await.is_empty());
}

#[tokio::test]
async fn retention_limit_evicts_oldest_finished_runs() {
    let h = harness_with(RuntimeConfig::default().with_retained_runs(1));
    let first = h.runtime.execute(branching(), inputs(json!({"x": 1}))).await.unwrap();
    let second = h.runtime.execute(branching(), inputs(json!({"x": 10}))).await.unwrap();
    let third = h.runtime.execute(branching(), inputs(json!({"x": 20}))).await.unwrap();

    let kept: Vec<_> = h.runtime.list_runs().await.into_iter().map(|(id, _)| id).collect();
    assert!(!kept.contains(&first.run_id));
    assert!(kept.contains(&second.run_id));
    assert!(kept.contains(&third.run_id));
    assert_eq!(kept.len(), 2);
}

#[tokio::test]
async fn unknown_run_is_reported() {
    let h = harness();
    let err = h.runtime.status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, FlowError::RunNotFound(_)));
}
