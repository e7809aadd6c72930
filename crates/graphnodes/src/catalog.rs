//! Built-in node definitions
//!
//! Agent, team, tool, memory, RAG, database and integration kinds are catalogued here
//! but their executors are supplied by the host application.

use graphcore::{
    category, ConfigType, DataType, FanIn, NodeDefinition, NodeKind, NodeTypeRegistry, Port,
    RegistryError, ERROR_PORT,
};
use serde_json::json;

fn input(name: &str, data_type: DataType) -> Port {
    Port::input(name, data_type)
}

fn output(name: &str, data_type: DataType) -> Port {
    Port::output(name, data_type)
}

fn error_port() -> Port {
    Port::output(ERROR_PORT, DataType::Object)
}

fn io() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(NodeKind::Input.as_str(), category::IO)
            .with_description("Start of the graph; publishes the run inputs")
            .with_output(output("output", DataType::Object))
            .with_dynamic_outputs(),
        NodeDefinition::new(NodeKind::Output.as_str(), category::IO)
            .with_description("Terminal that records a result of the run")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_option("required", ConfigType::Boolean, json!(true))
            .with_option("name", ConfigType::String, json!("")),
    ]
}

fn agents() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(NodeKind::Agent.as_str(), category::AGENTS)
            .with_description("Invoke a single LLM agent")
            .with_input(input("input", DataType::Message).required())
            .with_input(input("context", DataType::Any))
            .with_output(output("output", DataType::Message))
            .with_output(error_port())
            .with_option("model", ConfigType::String, json!("default"))
            .with_option("prompt", ConfigType::String, json!(""))
            .with_option("temperature", ConfigType::Number, json!(0.7)),
        NodeDefinition::new(NodeKind::Team.as_str(), category::AGENTS)
            .with_description("Invoke a team of cooperating agents")
            .with_input(input("input", DataType::Message).required())
            .with_input(input("context", DataType::Any))
            .with_output(output("output", DataType::Message))
            .with_output(error_port())
            .with_option("agents", ConfigType::Array, json!([]))
            .with_option("strategy", ConfigType::String, json!("sequential")),
        NodeDefinition::new(NodeKind::Tool.as_str(), category::AGENTS)
            .with_description("Call a registered tool")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("tool", ConfigType::String, json!("")),
    ]
}

fn control() -> Vec<NodeDefinition> {
    let wrapper = |kind: NodeKind, description: &str| {
        NodeDefinition::new(kind.as_str(), category::CONTROL)
            .with_description(description)
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_option("target", ConfigType::String, json!(""))
            .with_option("targetConfig", ConfigType::Object, json!({}))
    };

    vec![
        NodeDefinition::new(NodeKind::Condition.as_str(), category::CONTROL)
            .with_description("Route the input to `true` or `false`")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("true", DataType::Any))
            .with_output(output("false", DataType::Any))
            .with_option("condition", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::Switch.as_str(), category::CONTROL)
            .with_description("Route the input to the first matching labelled port, else `default`")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("default", DataType::Any))
            .with_dynamic_outputs()
            .with_option("cases", ConfigType::Array, json!([])),
        NodeDefinition::new(NodeKind::Loop.as_str(), category::CONTROL)
            .with_description("Run the body once per item")
            .with_input(input("items", DataType::Array).required())
            .with_input(input("feedback", DataType::Any))
            .with_output(output("item", DataType::Any))
            .with_output(output("index", DataType::Number))
            .with_output(output("complete", DataType::Array))
            .with_option("maxIterations", ConfigType::Number, json!(100))
            .with_option("concurrency", ConfigType::Number, json!(1)),
        NodeDefinition::new(NodeKind::Parallel.as_str(), category::CONTROL)
            .with_description("Forward the input to every connected branch")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_dynamic_outputs()
            .with_option("branches", ConfigType::Number, json!(2)),
        NodeDefinition::new(NodeKind::Join.as_str(), category::CONTROL)
            .with_description("Wait for every connected branch and emit their values")
            .with_input(input("inputs", DataType::Any).required().with_fan_in(FanIn::All))
            .with_output(output("output", DataType::Array)),
        NodeDefinition::new(NodeKind::Delay.as_str(), category::CONTROL)
            .with_description("Wait, then forward the input unchanged")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_option("delayMs", ConfigType::Number, json!(1000)),
        wrapper(NodeKind::Retry, "Re-invoke the target with exponential backoff")
            .with_output(error_port())
            .with_option("maxRetries", ConfigType::Number, json!(3))
            .with_option("backoffMs", ConfigType::Number, json!(200))
            .with_option("backoffMultiplier", ConfigType::Number, json!(2.0))
            .with_option("maxBackoffMs", ConfigType::Number, json!(30000)),
        wrapper(NodeKind::CircuitBreaker, "Stop calling a failing target for a cool-down period")
            .with_output(output("fallback", DataType::Any))
            .with_output(error_port())
            .with_option("threshold", ConfigType::Number, json!(5))
            .with_option("windowMs", ConfigType::Number, json!(60000))
            .with_option("cooldownMs", ConfigType::Number, json!(30000)),
        wrapper(NodeKind::RateLimiter, "Token-bucket limit shared by every invocation of the node")
            .with_output(error_port())
            .with_option("ratePerMinute", ConfigType::Number, json!(60))
            .with_option("burst", ConfigType::Number, json!(1)),
    ]
}

fn data() -> Vec<NodeDefinition> {
    let unary = |kind: NodeKind, description: &str, out: DataType| {
        NodeDefinition::new(kind.as_str(), category::DATA)
            .with_description(description)
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", out))
    };

    vec![
        unary(NodeKind::Transform, "Pick a path or build an object from paths", DataType::Any)
            .with_option("path", ConfigType::String, json!(""))
            .with_option("fields", ConfigType::Object, json!({})),
        NodeDefinition::new(NodeKind::Map.as_str(), category::DATA)
            .with_description("Transform every element of an array")
            .with_input(input("input", DataType::Array).required())
            .with_output(output("output", DataType::Array))
            .with_option("path", ConfigType::String, json!(""))
            .with_option("fields", ConfigType::Object, json!({})),
        NodeDefinition::new(NodeKind::Filter.as_str(), category::DATA)
            .with_description("Keep the elements matching a predicate")
            .with_input(input("input", DataType::Array).required())
            .with_output(output("output", DataType::Array))
            .with_output(output("rejected", DataType::Array))
            .with_option("condition", ConfigType::String, json!("true")),
        NodeDefinition::new(NodeKind::Merge.as_str(), category::DATA)
            .with_description("Forward the first value to arrive once every branch has resolved")
            .with_input(input("inputs", DataType::Any).required().with_fan_in(FanIn::Any))
            .with_output(output("output", DataType::Any)),
        unary(NodeKind::Split, "Split a string or chunk an array", DataType::Array)
            .with_output(output("count", DataType::Number))
            .with_option("separator", ConfigType::String, json!(","))
            .with_option("chunkSize", ConfigType::Number, json!(1)),
        NodeDefinition::new(NodeKind::Cache.as_str(), category::DATA)
            .with_description("Memoise the target's result per key")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("target", ConfigType::String, json!(""))
            .with_option("targetConfig", ConfigType::Object, json!({}))
            .with_option("keyPath", ConfigType::String, json!(""))
            .with_option("ttlMs", ConfigType::Number, json!(300000)),
        unary(NodeKind::Template, "Interpolate {{path}} placeholders", DataType::String)
            .with_option("template", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::JsonParse.as_str(), category::DATA)
            .with_description("Parse a JSON string")
            .with_input(input("input", DataType::String).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port()),
        unary(NodeKind::JsonStringify, "Serialise a value to a JSON string", DataType::String)
            .with_option("pretty", ConfigType::Boolean, json!(false)),
    ]
}

fn memory() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(NodeKind::MemoryRead.as_str(), category::MEMORY)
            .with_description("Read a value from agent memory")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("namespace", ConfigType::String, json!("default"))
            .with_option("key", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::MemoryWrite.as_str(), category::MEMORY)
            .with_description("Write a value to agent memory")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("namespace", ConfigType::String, json!("default"))
            .with_option("key", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::RagSearch.as_str(), category::MEMORY)
            .with_description("Retrieve documents relevant to a query")
            .with_input(input("input", DataType::String).required())
            .with_output(output("output", DataType::Array))
            .with_output(error_port())
            .with_option("index", ConfigType::String, json!(""))
            .with_option("topK", ConfigType::Number, json!(5)),
    ]
}

fn integration() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(NodeKind::Http.as_str(), category::INTEGRATION)
            .with_description("Make an HTTP request")
            .with_input(input("url", DataType::String))
            .with_input(input("body", DataType::Any))
            .with_output(output("status", DataType::Number))
            .with_output(output("body", DataType::Any))
            .with_output(output("headers", DataType::Object))
            .with_output(error_port())
            .with_option("url", ConfigType::String, json!(""))
            .with_option("method", ConfigType::String, json!("GET"))
            .with_option("headers", ConfigType::Object, json!({})),
        NodeDefinition::new(NodeKind::Webhook.as_str(), category::INTEGRATION)
            .with_description("POST the input as JSON to a URL")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("url", ConfigType::String, json!(""))
            .with_option("method", ConfigType::String, json!("POST"))
            .with_option("headers", ConfigType::Object, json!({})),
        NodeDefinition::new(NodeKind::Database.as_str(), category::INTEGRATION)
            .with_description("Run a database query")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Array))
            .with_output(error_port())
            .with_option("connection", ConfigType::String, json!(""))
            .with_option("query", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::Integration.as_str(), category::INTEGRATION)
            .with_description("Call a third-party integration")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(error_port())
            .with_option("service", ConfigType::String, json!(""))
            .with_option("action", ConfigType::String, json!("")),
    ]
}

fn governance() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(NodeKind::HumanApproval.as_str(), category::GOVERNANCE)
            .with_description("Suspend until a person approves or rejects")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("approved", DataType::Any))
            .with_output(output("rejected", DataType::Any))
            .with_option("prompt", ConfigType::String, json!("Approval required")),
        NodeDefinition::new(NodeKind::AuditLog.as_str(), category::GOVERNANCE)
            .with_description("Record the input in the audit trail and forward it")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_option("message", ConfigType::String, json!(""))
            .with_option("level", ConfigType::String, json!("info")),
        NodeDefinition::new(NodeKind::SecretFetch.as_str(), category::GOVERNANCE)
            .with_description("Read a secret from the environment")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(output("secret", DataType::String))
            .with_output(error_port())
            .with_option("name", ConfigType::String, json!("")),
        NodeDefinition::new(NodeKind::CostGuard.as_str(), category::GOVERNANCE)
            .with_description("Route to `exceeded` when the reported cost is over budget")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(output("exceeded", DataType::Any))
            .with_option("maxCost", ConfigType::Number, json!(1.0))
            .with_option("costPath", ConfigType::String, json!("cost")),
        NodeDefinition::new(NodeKind::PiiDetection.as_str(), category::GOVERNANCE)
            .with_description("Detect and optionally redact personal data")
            .with_input(input("input", DataType::Any).required())
            .with_output(output("output", DataType::Any))
            .with_output(output("findings", DataType::Array))
            .with_option("redact", ConfigType::Boolean, json!(true))
            .with_option("patterns", ConfigType::Array, json!(["email", "phone", "ssn", "credit-card"])),
    ]
}

/// Every built-in definition, grouped by category
pub fn definitions() -> Vec<NodeDefinition> {
    [io(), agents(), control(), data(), memory(), integration(), governance()]
        .into_iter()
        .flatten()
        .collect()
}

/// Register the built-in definitions
pub fn register_definitions(types: &mut NodeTypeRegistry) -> Result<(), RegistryError> {
    for definition in definitions() {
        types.register(definition)?;
    }
    Ok(())
}

/// Kinds whose executors come from the host
pub const EXTERNAL_KINDS: &[NodeKind] = &[
    NodeKind::Agent,
    NodeKind::Team,
    NodeKind::Tool,
    NodeKind::MemoryRead,
    NodeKind::MemoryWrite,
    NodeKind::RagSearch,
    NodeKind::Database,
    NodeKind::Integration,
];
