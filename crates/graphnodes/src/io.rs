use async_trait::async_trait;
use graphcore::{
    Config, NodeContext, NodeDefinition, NodeError, NodeExecutor, NodeKind, NodeOutput, Value,
    ERROR_PORT,
};
use graphruntime::ExecutorFactory;

/// Start node: publishes the run inputs as one object and one port per key
pub struct InputNode;

#[async_trait]
impl NodeExecutor for InputNode {
    fn node_type(&self) -> &str {
        NodeKind::Input.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        let mut output = NodeOutput::new();
        for key in keys {
            if key != "output" {
                output = output.with_output(key.clone(), ctx.inputs[key].clone());
            }
        }
        let all: serde_json::Map<String, Value> = ctx.inputs.into_iter().collect();
        Ok(output.with_output("output", Value::Object(all)))
    }
}

/// Terminal node: records its input as the result
pub struct OutputNode;

#[async_trait]
impl NodeExecutor for OutputNode {
    fn node_type(&self) -> &str {
        NodeKind::Output.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("input")?.clone();
        Ok(NodeOutput::new().with_output("output", value))
    }
}

/// Stand-in for host-supplied kinds: forwards `input` to the first declared output
pub struct EchoNode {
    node_type: String,
    port: String,
}

#[async_trait]
impl NodeExecutor for EchoNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("input")?.clone();
        ctx.events
            .info(format!("{} has no executor; echoing input", self.node_type));
        Ok(NodeOutput::new().with_output(self.port.clone(), value))
    }
}

pub struct EchoNodeFactory {
    node_type: String,
    port: String,
}

impl EchoNodeFactory {
    pub fn for_definition(definition: &NodeDefinition) -> Self {
        let port = definition
            .outputs
            .iter()
            .map(|p| p.name.as_str())
            .find(|name| *name != ERROR_PORT)
            .unwrap_or("output");
        Self {
            node_type: definition.node_type.clone(),
            port: port.to_string(),
        }
    }
}

impl ExecutorFactory for EchoNodeFactory {
    fn create(&self, _config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        Ok(Box::new(EchoNode {
            node_type: self.node_type.clone(),
            port: self.port.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }
}
