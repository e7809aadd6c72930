use async_trait::async_trait;
use graphcore::{
    Config, Invocation, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value,
};
use graphruntime::ExecutorFactory;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Node kind invoked on behalf of a wrapper, with its own configuration
#[derive(Debug, Clone)]
pub(crate) struct Target {
    node_type: String,
    config: Config,
}

impl Target {
    /// Read `target` / `targetConfig`; `None` when no target is named
    pub(crate) fn from_config(config: &Config) -> Result<Option<Self>, NodeError> {
        let node_type = match config.get("target") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => {
                return Err(NodeError::Configuration(format!(
                    "'target' must be a node type, got {}",
                    other
                )))
            }
        };
        let config = match config.get("targetConfig") {
            None | Some(Value::Null) => Config::new(),
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            Some(_) => {
                return Err(NodeError::Configuration(
                    "'targetConfig' must be an object".to_string(),
                ))
            }
        };
        Ok(Some(Self { node_type, config }))
    }

    pub(crate) fn required(config: &Config, wrapper: NodeKind) -> Result<Self, NodeError> {
        Self::from_config(config)?.ok_or_else(|| {
            NodeError::Configuration(format!("{} needs a 'target' node type", wrapper))
        })
    }

    pub(crate) async fn call(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.services
            .invoke(Invocation {
                caller: ctx.node_id.clone(),
                node_type: self.node_type.clone(),
                config: self.config.clone(),
                inputs: ctx.inputs.clone(),
                cancellation: ctx.cancellation.child_token(),
            })
            .await
    }
}

/// The value a wrapper forwards: the target's `output` port, its only port, or all of them
pub(crate) fn primary(output: &NodeOutput) -> Value {
    if let Some(value) = output.outputs.get("output") {
        return value.clone();
    }
    if output.outputs.len() == 1 {
        if let Some(value) = output.outputs.values().next() {
            return value.clone();
        }
    }
    Value::Object(output.outputs.clone().into_iter().collect())
}

/// Sleep that gives up when the node is cancelled
async fn pause(ctx: &NodeContext, duration: Duration) -> Result<(), NodeError> {
    tokio::select! {
        _ = sleep(duration) => Ok(()),
        _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled { committed: false }),
    }
}

/// Re-invokes its target with exponential backoff until it succeeds
pub struct RetryNode {
    target: Target,
}

#[async_trait]
impl NodeExecutor for RetryNode {
    fn node_type(&self) -> &str {
        NodeKind::Retry.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let max_retries = ctx.config_u32("maxRetries", 3)?;
        let mut backoff_ms = ctx.config_u64("backoffMs", 200)? as f64;
        let multiplier = ctx.config_f64("backoffMultiplier", 2.0)?.max(1.0);
        let max_backoff_ms = ctx.config_u64("maxBackoffMs", 30_000)? as f64;

        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let error = match self.target.call(&ctx).await {
                Ok(output) => {
                    if attempt > 1 {
                        ctx.events.info(format!("Succeeded on attempt {}", attempt));
                    }
                    return Ok(NodeOutput::new()
                        .with_output("output", primary(&output))
                        .with_attempts(attempt));
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => e,
            };

            if attempt > max_retries || attempt == u32::MAX {
                tracing::warn!(
                    "Retry {} giving up on {} after {} attempts: {}",
                    ctx.node_id,
                    self.target.node_type,
                    attempt,
                    error
                );
                return Err(NodeError::Exhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = backoff_ms.min(max_backoff_ms);
            ctx.events.warn(format!(
                "Attempt {} failed: {}; retrying in {}ms",
                attempt, error, delay as u64
            ));
            pause(&ctx, Duration::from_millis(delay as u64)).await?;
            backoff_ms *= multiplier;
        }
    }
}

pub struct RetryNodeFactory;

impl ExecutorFactory for RetryNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        Ok(Box::new(RetryNode {
            target: Target::required(config, NodeKind::Retry)?,
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Retry.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Probe,
    Open,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probing: bool,
}

impl BreakerState {
    fn admit(&mut self, now: Instant, cooldown: Duration) -> Admission {
        match self.opened_at {
            None => Admission::Closed,
            Some(_) if self.probing => Admission::Open,
            Some(opened) if now.duration_since(opened) >= cooldown => {
                self.probing = true;
                Admission::Probe
            }
            Some(_) => Admission::Open,
        }
    }

    fn succeeded(&mut self) {
        self.failures.clear();
        self.opened_at = None;
        self.probing = false;
    }

    /// Record a failure; true when this failure opens the circuit
    fn failed(&mut self, now: Instant, threshold: usize, window: Duration) -> bool {
        if self.probing {
            self.probing = false;
            self.opened_at = Some(now);
            return true;
        }
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.opened_at.is_none() && self.failures.len() >= threshold {
            self.opened_at = Some(now);
            return true;
        }
        false
    }
}

/// Stops invoking a failing target and answers on `fallback` until a cooldown passes
///
/// The circuit opens once `threshold` failures land inside `windowMs`. After
/// `cooldownMs` a single probe call is let through: success closes the circuit,
/// failure re-opens it.
pub struct CircuitBreakerNode {
    target: Target,
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerNode {
    fn state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl NodeExecutor for CircuitBreakerNode {
    fn node_type(&self) -> &str {
        NodeKind::CircuitBreaker.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let admission = self.state().admit(Instant::now(), self.cooldown);

        if admission == Admission::Open {
            ctx.events
                .warn(NodeError::CircuitOpen(ctx.node_id.clone()).to_string());
            return Ok(NodeOutput::new()
                .with_output("fallback", input)
                .with_metric("circuit", "open")
                .with_attempts(0));
        }
        if admission == Admission::Probe {
            ctx.events.info("Cooldown elapsed; probing target");
        }

        match self.target.call(&ctx).await {
            Ok(output) => {
                self.state().succeeded();
                Ok(NodeOutput::new()
                    .with_output("output", primary(&output))
                    .with_metric("circuit", "closed"))
            }
            Err(e) if e.is_cancellation() => {
                if admission == Admission::Probe {
                    self.state().probing = false;
                }
                Err(e)
            }
            Err(e) => {
                let opened = self
                    .state()
                    .failed(Instant::now(), self.threshold, self.window);
                if opened {
                    tracing::warn!(
                        "Circuit {} opened after failure of {}: {}",
                        ctx.node_id,
                        self.target.node_type,
                        e
                    );
                    ctx.events.warn(format!("Circuit opened: {}", e));
                }
                Err(e)
            }
        }
    }
}

pub struct CircuitBreakerNodeFactory;

impl ExecutorFactory for CircuitBreakerNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let millis = |name: &str, default: u64| {
            config.get(name).and_then(Value::as_u64).unwrap_or(default)
        };
        let threshold = usize::try_from(millis("threshold", 5)).unwrap_or(usize::MAX);
        Ok(Box::new(CircuitBreakerNode {
            target: Target::required(config, NodeKind::CircuitBreaker)?,
            threshold: threshold.max(1),
            window: Duration::from_millis(millis("windowMs", 60_000)),
            cooldown: Duration::from_millis(millis("cooldownMs", 30_000)),
            state: Mutex::new(BreakerState::default()),
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::CircuitBreaker.as_str()
    }
}

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token bucket in front of an optional target
///
/// Callers that find the bucket empty wait their turn in arrival order rather than
/// failing.
pub struct RateLimiterNode {
    target: Option<Target>,
    per_second: f64,
    burst: f64,
    bucket: tokio::sync::Mutex<Bucket>,
}

impl RateLimiterNode {
    /// Take one token, waiting for a refill if needed; returns the time spent waiting
    async fn acquire(&self, ctx: &NodeContext) -> Result<Duration, NodeError> {
        let started = Instant::now();
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            let refill = now.duration_since(bucket.refilled).as_secs_f64() * self.per_second;
            bucket.tokens = (bucket.tokens + refill).min(self.burst);
            bucket.refilled = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(started.elapsed());
            }
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second);
            tracing::debug!("Rate limiter {} waiting {:?}", ctx.node_id, wait);
            pause(ctx, wait).await?;
        }
    }
}

#[async_trait]
impl NodeExecutor for RateLimiterNode {
    fn node_type(&self) -> &str {
        NodeKind::RateLimiter.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let waited = self.acquire(&ctx).await?;
        if !waited.is_zero() {
            ctx.events
                .info(format!("Waited {}ms for capacity", waited.as_millis()));
        }

        let value = match &self.target {
            Some(target) => primary(&target.call(&ctx).await?),
            None => input,
        };
        Ok(NodeOutput::new()
            .with_output("output", value)
            .with_metric("waitedMs", waited.as_millis() as u64))
    }
}

pub struct RateLimiterNodeFactory;

impl ExecutorFactory for RateLimiterNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let rate = config
            .get("ratePerMinute")
            .and_then(Value::as_f64)
            .unwrap_or(60.0);
        if rate <= 0.0 {
            return Err(NodeError::Configuration(
                "'ratePerMinute' must be positive".to_string(),
            ));
        }
        let burst = config
            .get("burst")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .max(1.0);
        Ok(Box::new(RateLimiterNode {
            target: Target::from_config(config)?,
            per_second: rate / 60.0,
            burst,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::RateLimiter.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphcore::{ApprovalSignal, RunServices};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Fails the first `failures` invocations, then echoes the input
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RunServices for Flaky {
        async fn invoke(&self, invocation: Invocation) -> Result<NodeOutput, NodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(NodeError::execution(format!("call {} failed", call + 1)));
            }
            let input = invocation.inputs.get("input").cloned().unwrap_or(Value::Null);
            Ok(NodeOutput::new().with_output("output", input))
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

    fn config(value: Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    fn ctx(node_type: &str, services: Arc<Flaky>, settings: &Config) -> NodeContext {
        let mut ctx = NodeContext::detached("w", node_type).with_input("input", json!({"q": 1}));
        ctx.config = settings.clone();
        ctx.services = services;
        ctx
    }

    #[tokio::test]
    async fn retry_reports_attempts_on_success() {
        let settings = config(json!({"target": "tool", "maxRetries": 3, "backoffMs": 1}));
        let node = RetryNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(2);
        let out = node.execute(ctx("retry", flaky.clone(), &settings)).await.unwrap();
        assert_eq!(out.outputs["output"], json!({"q": 1}));
        assert_eq!(out.metrics.attempts, Some(3));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let settings = config(json!({"target": "tool", "maxRetries": 2, "backoffMs": 1}));
        let node = RetryNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(10);
        let err = node.execute(ctx("retry", flaky.clone(), &settings)).await.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert!(matches!(err, NodeError::Exhausted { .. }));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn oversized_retry_limit_still_retries() {
        // 2^32 used to wrap to zero retries
        let settings = config(json!({"target": "tool", "maxRetries": 1u64 << 32, "backoffMs": 1}));
        let node = RetryNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(2);
        let out = node.execute(ctx("retry", flaky.clone(), &settings)).await.unwrap();
        assert_eq!(out.metrics.attempts, Some(3));
    }

    #[test]
    fn wrappers_need_a_target() {
        assert!(RetryNodeFactory.create(&Config::new()).is_err());
        assert!(CircuitBreakerNodeFactory.create(&Config::new()).is_err());
        assert!(RateLimiterNodeFactory.create(&Config::new()).is_ok());
    }

    #[tokio::test]
    async fn breaker_opens_at_threshold() {
        let settings = config(json!({"target": "tool", "threshold": 2, "cooldownMs": 60000}));
        let node = CircuitBreakerNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(10);

        for _ in 0..2 {
            assert!(node.execute(ctx("circuit-breaker", flaky.clone(), &settings)).await.is_err());
        }
        let out = node
            .execute(ctx("circuit-breaker", flaky.clone(), &settings))
            .await
            .unwrap();
        assert_eq!(out.outputs["fallback"], json!({"q": 1}));
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn breaker_probe_closes_the_circuit() {
        let settings = config(json!({"target": "tool", "threshold": 1, "cooldownMs": 0}));
        let node = CircuitBreakerNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(1);

        assert!(node.execute(ctx("circuit-breaker", flaky.clone(), &settings)).await.is_err());
        let out = node
            .execute(ctx("circuit-breaker", flaky.clone(), &settings))
            .await
            .unwrap();
        assert!(out.outputs.contains_key("output"));
        assert_eq!(out.metrics.custom["circuit"], json!("closed"));
    }

    #[test]
    fn breaker_window_forgets_old_failures() {
        let mut state = BreakerState::default();
        let start = Instant::now();
        let window = Duration::from_millis(100);
        assert!(!state.failed(start, 2, window));
        assert!(!state.failed(start + Duration::from_millis(500), 2, window));
        assert!(state.failed(start + Duration::from_millis(550), 2, window));
    }

    #[tokio::test]
    async fn limiter_passes_through_without_target() {
        let settings = config(json!({"ratePerMinute": 6000, "burst": 2}));
        let node = RateLimiterNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(0);
        for _ in 0..3 {
            let out = node
                .execute(ctx("rate-limiter", flaky.clone(), &settings))
                .await
                .unwrap();
            assert_eq!(out.outputs["output"], json!({"q": 1}));
        }
        assert_eq!(flaky.calls(), 0);
    }

    #[tokio::test]
    async fn limiter_queues_when_the_bucket_is_empty() {
        let settings = config(json!({"ratePerMinute": 600, "burst": 1}));
        let node = RateLimiterNodeFactory.create(&settings).unwrap();
        let flaky = Flaky::new(0);

        let first = node.execute(ctx("rate-limiter", flaky.clone(), &settings)).await.unwrap();
        assert_eq!(first.metrics.custom["waitedMs"], json!(0));
        let second = node.execute(ctx("rate-limiter", flaky.clone(), &settings)).await.unwrap();
        assert!(second.metrics.custom["waitedMs"].as_u64().unwrap() >= 50);
    }
}
