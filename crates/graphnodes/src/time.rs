use async_trait::async_trait;
use graphcore::{NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};
use tokio::time::{sleep, Duration};

/// Suspend for `delayMs`, then forward the input unchanged
pub struct DelayNode;

#[async_trait]
impl NodeExecutor for DelayNode {
    fn node_type(&self) -> &str {
        NodeKind::Delay.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let delay_ms = ctx.config_u64("delayMs", 1000)?;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => {
                return Err(NodeError::Cancelled { committed: false });
            }
        }

        Ok(NodeOutput::new().with_output("output", input))
    }
}
