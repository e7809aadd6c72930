use crate::expr::Expr;
use async_trait::async_trait;
use graphcore::{Config, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value};
use graphruntime::ExecutorFactory;

fn parse_option(config: &Config, name: &str) -> Result<Option<Expr>, NodeError> {
    match config.get(name).and_then(Value::as_str).map(str::trim) {
        Some(source) if !source.is_empty() => Expr::parse(source).map(Some),
        _ => Ok(None),
    }
}

/// Activates `true` or `false` depending on a predicate over the input
///
/// The predicate is the `condition` option, or failing that the condition written on
/// the outgoing `true` edge.
pub struct ConditionNode {
    condition: Option<Expr>,
}

#[async_trait]
impl NodeExecutor for ConditionNode {
    fn node_type(&self) -> &str {
        NodeKind::Condition.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let condition = match &self.condition {
            Some(expr) => expr.clone(),
            None => {
                let source = ctx
                    .outgoing
                    .iter()
                    .filter(|e| e.from.port == "true")
                    .find_map(|e| e.condition.as_deref())
                    .ok_or_else(|| {
                        NodeError::Configuration("condition node has no 'condition'".to_string())
                    })?;
                Expr::parse(source)?
            }
        };

        let result = condition.matches(&input);
        tracing::debug!("Condition {} evaluated to {}", ctx.node_id, result);
        Ok(NodeOutput::new()
            .with_output(if result { "true" } else { "false" }, input)
            .with_metric("result", result))
    }
}

pub struct ConditionNodeFactory;

impl ExecutorFactory for ConditionNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        Ok(Box::new(ConditionNode {
            condition: parse_option(config, "condition")?,
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Condition.as_str()
    }
}

/// Activates the first labelled port whose predicate holds, else `default`
///
/// Cases come from the `cases` option (`[{"port", "condition"}]`) followed by the
/// conditions written on outgoing edges.
pub struct SwitchNode {
    cases: Vec<(String, Expr)>,
}

#[async_trait]
impl NodeExecutor for SwitchNode {
    fn node_type(&self) -> &str {
        NodeKind::Switch.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();

        let mut chosen = self
            .cases
            .iter()
            .find(|(_, expr)| expr.matches(&input))
            .map(|(port, _)| port.clone());
        if chosen.is_none() {
            for edge in ctx.outgoing.iter().filter(|e| e.from.port != "default") {
                if let Some(source) = edge.condition.as_deref() {
                    if Expr::parse(source)?.matches(&input) {
                        chosen = Some(edge.from.port.clone());
                        break;
                    }
                }
            }
        }

        let port = chosen.unwrap_or_else(|| "default".to_string());
        tracing::debug!("Switch {} selected '{}'", ctx.node_id, port);
        Ok(NodeOutput::new()
            .with_metric("selected", port.clone())
            .with_output(port, input))
    }
}

pub struct SwitchNodeFactory;

impl ExecutorFactory for SwitchNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let cases = match config.get("cases") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|case| {
                    let port = case.get("port").or_else(|| case.get("label")).and_then(Value::as_str);
                    let condition = case.get("condition").and_then(Value::as_str);
                    match (port, condition) {
                        (Some(port), Some(condition)) => Ok((port.to_string(), Expr::parse(condition)?)),
                        _ => Err(NodeError::Configuration(
                            "each switch case needs 'port' and 'condition'".to_string(),
                        )),
                    }
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(NodeError::Configuration("'cases' must be an array".to_string()))
            }
        };
        Ok(Box::new(SwitchNode { cases }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Switch.as_str()
    }
}

/// Forwards its input to `output` and every other connected port
pub struct ParallelNode;

#[async_trait]
impl NodeExecutor for ParallelNode {
    fn node_type(&self) -> &str {
        NodeKind::Parallel.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let mut output = NodeOutput::new().with_output("output", input.clone());
        for edge in &ctx.outgoing {
            if !output.outputs.contains_key(&edge.from.port) {
                output = output.with_output(edge.from.port.clone(), input.clone());
            }
        }
        let branches = ctx.outgoing.len();
        Ok(output.with_metric("branches", branches))
    }
}

/// Emits the values of every connected branch, in edge order
pub struct JoinNode;

#[async_trait]
impl NodeExecutor for JoinNode {
    fn node_type(&self) -> &str {
        NodeKind::Join.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let values = match ctx.require_input("inputs")? {
            Value::Array(values) => values.clone(),
            other => vec![other.clone()],
        };
        Ok(NodeOutput::new().with_output("output", Value::Array(values)))
    }
}

/// Forwards whichever branch delivered first
pub struct MergeNode;

#[async_trait]
impl NodeExecutor for MergeNode {
    fn node_type(&self) -> &str {
        NodeKind::Merge.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("inputs")?.clone();
        Ok(NodeOutput::new().with_output("output", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphcore::{Edge, Endpoint};
    use serde_json::json;

    fn config(value: Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn condition_routes_on_predicate() {
        let node = ConditionNodeFactory
            .create(&config(json!({"condition": "x > 5"})))
            .unwrap();
        let out = node
            .execute(NodeContext::detached("c", "condition").with_input("input", json!({"x": 10})))
            .await
            .unwrap();
        assert_eq!(out.outputs.get("true"), Some(&json!({"x": 10})));
        assert!(!out.outputs.contains_key("false"));
    }

    #[tokio::test]
    async fn condition_falls_back_to_edge_condition() {
        let node = ConditionNodeFactory.create(&Config::new()).unwrap();
        let mut ctx = NodeContext::detached("c", "condition").with_input("input", json!({"x": 1}));
        ctx.outgoing = vec![Edge::new("e", Endpoint::new("c", "true"), Endpoint::new("t", "input"))
            .with_condition("x > 5")];
        let out = node.execute(ctx).await.unwrap();
        assert!(out.outputs.contains_key("false"));
    }

    #[test]
    fn bad_condition_is_rejected_at_creation() {
        assert!(ConditionNodeFactory
            .create(&config(json!({"condition": "x >"})))
            .is_err());
    }

    #[tokio::test]
    async fn switch_picks_first_matching_case() {
        let node = SwitchNodeFactory
            .create(&config(json!({"cases": [
                {"port": "big", "condition": "n > 100"},
                {"port": "medium", "condition": "n > 10"}
            ]})))
            .unwrap();
        let run = |n: i64| {
            node.execute(NodeContext::detached("s", "switch").with_input("input", json!({"n": n})))
        };
        assert!(run(500).await.unwrap().outputs.contains_key("big"));
        assert!(run(50).await.unwrap().outputs.contains_key("medium"));
        assert!(run(5).await.unwrap().outputs.contains_key("default"));
    }

    #[tokio::test]
    async fn parallel_feeds_every_connected_port() {
        let mut ctx = NodeContext::detached("p", "parallel").with_input("input", 1);
        ctx.outgoing = vec![
            Edge::new("e1", Endpoint::new("p", "output"), Endpoint::new("a", "input")),
            Edge::new("e2", Endpoint::new("p", "b"), Endpoint::new("b", "input")),
        ];
        let out = ParallelNode.execute(ctx).await.unwrap();
        assert_eq!(out.outputs.len(), 2);
        assert_eq!(out.outputs["b"], json!(1));
    }
}
