use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use graphcore::{NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value, ValueExt};

/// Runs its body once per item of `items`
///
/// Up to `concurrency` iterations run at once; results keep item order. A failed
/// iteration contributes `null` and is counted in `failedIterations`.
pub struct LoopNode;

#[async_trait]
impl NodeExecutor for LoopNode {
    fn node_type(&self) -> &str {
        NodeKind::Loop.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = match ctx.require_input("items")? {
            Value::Array(items) => items.clone(),
            other => {
                return Err(NodeError::InvalidInputType {
                    field: "items".to_string(),
                    expected: "array".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };
        let max_iterations = ctx.config_u32("maxIterations", 100)? as usize;
        let concurrency = ctx.config_u32("concurrency", 1)?.max(1) as usize;

        if items.len() > max_iterations {
            ctx.events.warn(format!(
                "Stopping after {} of {} items (maxIterations)",
                max_iterations,
                items.len()
            ));
        }
        let items: Vec<Value> = items.into_iter().take(max_iterations).collect();
        let total = items.len();

        let results: Vec<Result<Value, NodeError>> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let services = ctx.services.clone();
                let node = ctx.node_id.clone();
                let token = ctx.cancellation.child_token();
                async move { services.run_body(&node, item, index as u32, token).await }
            })
            .buffered(concurrency)
            .collect()
            .await;

        if ctx.is_cancelled() {
            return Err(NodeError::Cancelled { committed: false });
        }

        let mut complete = Vec::with_capacity(total);
        let mut failed = 0usize;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => complete.push(value),
                Err(e @ NodeError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Loop {} iteration {} failed: {}", ctx.node_id, index, e);
                    ctx.events.warn(format!("Iteration {} failed: {}", index, e));
                    complete.push(Value::Null);
                }
            }
        }

        ctx.events.info(format!("Completed {} iteration(s), {} failed", total, failed));
        Ok(NodeOutput::new()
            .with_output("complete", Value::Array(complete))
            .with_metric("iterations", total)
            .with_metric("failedIterations", failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphcore::{ApprovalSignal, Invocation, RunServices};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Doubles numbers and fails on strings
    #[derive(Default)]
    struct Body {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunServices for Body {
        async fn invoke(&self, _invocation: Invocation) -> Result<NodeOutput, NodeError> {
            unreachable!()
        }

        async fn run_body(
            &self,
            _loop_node: &str,
            item: Value,
            _index: u32,
            _cancellation: CancellationToken,
        ) -> Result<Value, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            item.as_f64()
                .map(|n| json!(n * 2.0))
                .ok_or_else(|| NodeError::execution("not a number"))
        }

        async fn await_approval(&self, _node_id: &str) -> Result<ApprovalSignal, NodeError> {
            unreachable!()
        }
    }

    fn ctx(items: Value, services: Arc<Body>) -> NodeContext {
        let mut ctx = NodeContext::detached("each", "loop").with_input("items", items);
        ctx.services = services;
        ctx
    }

    #[tokio::test]
    async fn collects_results_in_item_order() {
        let body = Arc::new(Body::default());
        let out = LoopNode
            .execute(ctx(json!([1, "x", 3]), body.clone()).with_config("concurrency", 3))
            .await
            .unwrap();
        assert_eq!(out.outputs["complete"], json!([2.0, null, 6.0]));
        assert_eq!(out.metrics.custom["iterations"], json!(3));
        assert_eq!(out.metrics.custom["failedIterations"], json!(1));
    }

    #[tokio::test]
    async fn max_iterations_bounds_the_run() {
        let body = Arc::new(Body::default());
        let out = LoopNode
            .execute(ctx(json!([1, 2, 3, 4]), body.clone()).with_config("maxIterations", 2))
            .await
            .unwrap();
        assert_eq!(out.outputs["complete"], json!([2.0, 4.0]));
        assert_eq!(body.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_array_items_are_rejected() {
        let body = Arc::new(Body::default());
        let err = LoopNode.execute(ctx(json!("abc"), body)).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidInputType { .. }));
    }
}
