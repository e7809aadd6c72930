use async_trait::async_trait;
use graphcore::{Decision, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};

/// Suspends its branch until `approve` or `reject` is delivered to the run
pub struct HumanApprovalNode;

#[async_trait]
impl NodeExecutor for HumanApprovalNode {
    fn node_type(&self) -> &str {
        NodeKind::HumanApproval.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let prompt = ctx.config_str("prompt").unwrap_or("Approval required").to_string();
        ctx.events.info(prompt);

        let signal = ctx.services.await_approval(&ctx.node_id).await?;
        let port = match signal.decision {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        };
        ctx.events.info(format!("Decision: {}", signal.decision));

        let mut output = NodeOutput::new()
            .with_output(port, input)
            .with_metric("decision", signal.decision.to_string());
        if let Some(comment) = signal.comment {
            output = output.with_metric("comment", comment);
        }
        Ok(output)
    }
}
