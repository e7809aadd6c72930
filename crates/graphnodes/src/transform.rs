use crate::expr::Expr;
use async_trait::async_trait;
use graphcore::{Config, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value, ValueExt};
use graphruntime::ExecutorFactory;
use regex::{Captures, Regex};
use serde_json::Map;

fn expect_array<'a>(field: &str, value: &'a Value) -> Result<&'a Vec<Value>, NodeError> {
    value.as_array().ok_or_else(|| NodeError::InvalidInputType {
        field: field.to_string(),
        expected: "array".to_string(),
        actual: value.type_name().to_string(),
    })
}

/// Reshape a value: pick `fields` into a new object, or extract `path`, or keep it
fn reshape(value: &Value, config: &Config) -> Value {
    if let Some(Value::Object(fields)) = config.get("fields") {
        if !fields.is_empty() {
            let picked: Map<String, Value> = fields
                .iter()
                .map(|(name, path)| {
                    let path = path.as_str().unwrap_or(name);
                    (name.clone(), value.lookup(path).cloned().unwrap_or(Value::Null))
                })
                .collect();
            return Value::Object(picked);
        }
    }
    match config.get("path").and_then(Value::as_str) {
        Some(path) if !path.is_empty() => value.lookup(path).cloned().unwrap_or(Value::Null),
        _ => value.clone(),
    }
}

/// Projects the input through `path` or `fields`
pub struct TransformNode;

#[async_trait]
impl NodeExecutor for TransformNode {
    fn node_type(&self) -> &str {
        NodeKind::Transform.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?;
        Ok(NodeOutput::new().with_output("output", reshape(input, &ctx.config)))
    }
}

/// Applies the transform projection to every element of an array
pub struct MapNode;

#[async_trait]
impl NodeExecutor for MapNode {
    fn node_type(&self) -> &str {
        NodeKind::Map.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = expect_array("input", ctx.require_input("input")?)?;
        let mapped: Vec<Value> = items.iter().map(|item| reshape(item, &ctx.config)).collect();
        let count = mapped.len();
        Ok(NodeOutput::new()
            .with_output("output", Value::Array(mapped))
            .with_metric("count", count))
    }
}

/// Splits an array into `output` and `rejected` by a predicate
///
/// The predicate sees each element's own fields plus `item` and `index`.
pub struct FilterNode {
    condition: Expr,
}

#[async_trait]
impl NodeExecutor for FilterNode {
    fn node_type(&self) -> &str {
        NodeKind::Filter.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = expect_array("input", ctx.require_input("input")?)?;
        let (mut kept, mut rejected) = (Vec::new(), Vec::new());
        for (index, item) in items.iter().enumerate() {
            let mut scope = match item {
                Value::Object(fields) => fields.clone(),
                _ => Map::new(),
            };
            scope.insert("item".to_string(), item.clone());
            scope.insert("index".to_string(), Value::from(index));
            if self.condition.matches(&Value::Object(scope)) {
                kept.push(item.clone());
            } else {
                rejected.push(item.clone());
            }
        }
        let kept_count = kept.len();
        Ok(NodeOutput::new()
            .with_output("output", Value::Array(kept))
            .with_output("rejected", Value::Array(rejected))
            .with_metric("kept", kept_count))
    }
}

pub struct FilterNodeFactory;

impl ExecutorFactory for FilterNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let source = config
            .get("condition")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("true");
        Ok(Box::new(FilterNode {
            condition: Expr::parse(source)?,
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Filter.as_str()
    }
}

/// Breaks a string on `separator`, or an array into chunks of `chunkSize`
pub struct SplitNode;

#[async_trait]
impl NodeExecutor for SplitNode {
    fn node_type(&self) -> &str {
        NodeKind::Split.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let parts: Vec<Value> = match ctx.require_input("input")? {
            Value::String(text) => {
                let separator = ctx.config_str("separator").unwrap_or(",");
                if text.is_empty() {
                    Vec::new()
                } else if separator.is_empty() {
                    text.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    text.split(separator)
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect()
                }
            }
            Value::Array(items) => {
                let size = ctx.config_u32("chunkSize", 1)?.max(1) as usize;
                if size == 1 {
                    items.clone()
                } else {
                    items.chunks(size).map(|chunk| Value::Array(chunk.to_vec())).collect()
                }
            }
            other => {
                return Err(NodeError::InvalidInputType {
                    field: "input".to_string(),
                    expected: "string or array".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };
        let count = parts.len();
        Ok(NodeOutput::new()
            .with_output("output", Value::Array(parts))
            .with_output("count", count))
    }
}

/// Renders `template`, replacing `{{path}}` with values looked up in the input
pub struct TemplateNode {
    template: String,
    placeholder: Regex,
}

impl TemplateNode {
    fn render(&self, scope: &Value) -> String {
        self.placeholder
            .replace_all(&self.template, |caps: &Captures| {
                let path = caps[1].trim();
                let path = path.strip_prefix("input.").unwrap_or(path);
                match scope.lookup(path) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                }
            })
            .into_owned()
    }
}

#[async_trait]
impl NodeExecutor for TemplateNode {
    fn node_type(&self) -> &str {
        NodeKind::Template.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?;
        Ok(NodeOutput::new().with_output("output", self.render(input)))
    }
}

pub struct TemplateNodeFactory;

impl ExecutorFactory for TemplateNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let template = config
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let placeholder = Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}")
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        Ok(Box::new(TemplateNode {
            template,
            placeholder,
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::Template.as_str()
    }
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl NodeExecutor for JsonParseNode {
    fn node_type(&self) -> &str {
        NodeKind::JsonParse.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?;
        let text = input.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "input".to_string(),
            expected: "string".to_string(),
            actual: input.type_name().to_string(),
        })?;

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::execution(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("output", parsed))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl NodeExecutor for JsonStringifyNode {
    fn node_type(&self) -> &str {
        NodeKind::JsonStringify.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("input")?;
        let pretty = ctx.config.get("pretty").map(Value::truthy).unwrap_or(false);

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::execution(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("output", json_str))
    }
}
