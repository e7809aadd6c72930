use crate::resilience::{primary, Target};
use async_trait::async_trait;
use graphcore::{Config, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value, ValueExt};
use graphruntime::ExecutorFactory;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

struct Entry {
    stored: Instant,
    value: Value,
}

/// Memoizes its target's result per key for `ttlMs`
///
/// The key is the value found at `keyPath` in the input (the whole input when the
/// path is empty). Without a target the input itself is cached. Entries live as long
/// as the node instance, which is one run.
pub struct CacheNode {
    target: Option<Target>,
    key_path: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CacheNode {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.stored.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl NodeExecutor for CacheNode {
    fn node_type(&self) -> &str {
        NodeKind::Cache.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let key_value = input.lookup(&self.key_path).cloned().unwrap_or(Value::Null);
        let key = serde_json::to_string(&key_value)
            .map_err(|e| NodeError::execution(format!("cache key error: {}", e)))?;

        if let Some(value) = self.cached(&key) {
            tracing::debug!("Cache {} hit for {}", ctx.node_id, key);
            return Ok(NodeOutput::new()
                .with_output("output", value)
                .with_metric("hit", true)
                .with_attempts(0));
        }

        let value = match &self.target {
            Some(target) => primary(&target.call(&ctx).await?),
            None => input,
        };
        self.entries().insert(
            key,
            Entry {
                stored: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(NodeOutput::new()
            .with_output("output", value)
            .with_metric("hit", false))
    }
}

pub struct CacheNodeFactory;

impl ExecutorFactory for CacheNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let ttl_ms = config
            .get("ttlMs")
            .and_then(Value::as_u64)
            .unwrap_or(300_000);
        Ok(Box::new(CacheNode {
            target: Target::from_config(config)?,
            key_path: config
                .get("keyPath")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            ttl: Duration::from_millis(ttl_ms),
            entries: Mutex::new(HashMap::new()),
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Cache.as_str()
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

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunServices for Counter {
        async fn invoke(&self, _invocation: Invocation) -> Result<NodeOutput, NodeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(NodeOutput::new().with_output("output", n))
        }

        async fn run_body(
            &self,
            _loop_node: &str,
            _item: Value,
            _index: u32,
            _cancellation: CancellationToken,
        ) -> Result<Value, NodeError> {
            unreachable!()
        }

        async fn await_approval(&self, _node_id: &str) -> Result<ApprovalSignal, NodeError> {
            unreachable!()
        }
    }

    fn node(config: Value) -> Box<dyn NodeExecutor> {
        CacheNodeFactory
            .create(&serde_json::from_value(config).unwrap())
            .unwrap()
    }

    fn ctx(input: Value, services: Arc<Counter>) -> NodeContext {
        let mut ctx = NodeContext::detached("c", "cache").with_input("input", input);
        ctx.services = services;
        ctx
    }

    #[tokio::test]
    async fn repeated_keys_hit_the_cache() {
        let node = node(json!({"target": "tool", "keyPath": "id"}));
        let counter = Arc::new(Counter::default());

        let first = node.execute(ctx(json!({"id": 1, "x": "a"}), counter.clone())).await.unwrap();
        let second = node.execute(ctx(json!({"id": 1, "x": "b"}), counter.clone())).await.unwrap();
        let third = node.execute(ctx(json!({"id": 2}), counter.clone())).await.unwrap();

        assert_eq!(first.outputs["output"], json!(1));
        assert_eq!(second.outputs["output"], json!(1));
        assert_eq!(second.metrics.custom["hit"], json!(true));
        assert_eq!(third.outputs["output"], json!(2));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let node = node(json!({"target": "tool", "ttlMs": 0}));
        let counter = Arc::new(Counter::default());
        node.execute(ctx(json!("k"), counter.clone())).await.unwrap();
        let again = node.execute(ctx(json!("k"), counter.clone())).await.unwrap();
        assert_eq!(again.outputs["output"], json!(2));
    }
}
