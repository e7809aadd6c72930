use async_trait::async_trait;
use graphcore::{Config, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value, ValueExt};
use graphruntime::ExecutorFactory;
use regex::Regex;
use serde_json::{json, Map};

/// Records the input to the log and the run's event stream, then forwards it
pub struct AuditLogNode;

#[async_trait]
impl NodeExecutor for AuditLogNode {
    fn node_type(&self) -> &str {
        NodeKind::AuditLog.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let message = ctx.config_str("message").unwrap_or("audit").to_string();
        let level = ctx.config_str("level").unwrap_or("info").to_ascii_lowercase();

        match level.as_str() {
            "warn" | "warning" => {
                tracing::warn!(run_id = %ctx.run_id, node = %ctx.node_id, payload = %input, "AUDIT: {}", message);
                ctx.events.warn(format!("AUDIT: {}", message));
            }
            "debug" => {
                tracing::debug!(run_id = %ctx.run_id, node = %ctx.node_id, payload = %input, "AUDIT: {}", message);
                ctx.events.info(format!("AUDIT: {}", message));
            }
            _ => {
                tracing::info!(run_id = %ctx.run_id, node = %ctx.node_id, payload = %input, "AUDIT: {}", message);
                ctx.events.info(format!("AUDIT: {}", message));
            }
        }
        ctx.events.data("output", input.clone());

        Ok(NodeOutput::new()
            .with_output("output", input)
            .with_metric("loggedAt", chrono::Utc::now().to_rfc3339()))
    }
}

/// Reads the secret named by `name` from the process environment
pub struct SecretFetchNode {
    name: String,
}

#[async_trait]
impl NodeExecutor for SecretFetchNode {
    fn node_type(&self) -> &str {
        NodeKind::SecretFetch.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let secret = std::env::var(&self.name)
            .map_err(|_| NodeError::execution(format!("secret '{}' is not set", self.name)))?;
        ctx.events.info(format!("Fetched secret '{}'", self.name));

        let passthrough = ctx.inputs.get("input").cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::new()
            .with_output("output", passthrough)
            .with_output("secret", secret))
    }
}

pub struct SecretFetchNodeFactory;

impl ExecutorFactory for SecretFetchNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NodeError::Configuration("secret-fetch needs a 'name'".to_string()))?;
        Ok(Box::new(SecretFetchNode {
            name: name.to_string(),
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::SecretFetch.as_str()
    }
}

/// Diverts inputs whose cost exceeds `maxCost` to `exceeded`
pub struct CostGuardNode;

#[async_trait]
impl NodeExecutor for CostGuardNode {
    fn node_type(&self) -> &str {
        NodeKind::CostGuard.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?.clone();
        let max_cost = ctx.config_f64("maxCost", 1.0)?;
        let path = ctx.config_str("costPath").unwrap_or("cost");

        let cost = match input.lookup(path) {
            None | Some(Value::Null) => 0.0,
            Some(value) => value.as_f64().ok_or_else(|| NodeError::InvalidInputType {
                field: path.to_string(),
                expected: "number".to_string(),
                actual: value.type_name().to_string(),
            })?,
        };

        let port = if cost > max_cost {
            ctx.events
                .warn(format!("Cost {} exceeds budget {}", cost, max_cost));
            "exceeded"
        } else {
            "output"
        };
        Ok(NodeOutput::new()
            .with_output(port, input)
            .with_metric("cost", cost))
    }
}

/// Well-known patterns available to `patterns`
const PII_PATTERNS: &[(&str, &str)] = &[
    ("email", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("credit-card", r"\b(?:\d[ -]?){12,15}\d\b"),
    ("phone", r"\+?\d{1,3}[\s.-]?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b"),
];

/// Scans every string in the input for personal data and optionally redacts it
pub struct PiiDetectionNode {
    patterns: Vec<(String, Regex)>,
    redact: bool,
}

impl PiiDetectionNode {
    fn scan(&self, value: &Value, counts: &mut Map<String, Value>) -> Value {
        match value {
            Value::String(text) => {
                let mut text = text.clone();
                for (name, pattern) in &self.patterns {
                    let found = pattern.find_iter(&text).count();
                    if found == 0 {
                        continue;
                    }
                    let total = counts.get(name).and_then(Value::as_u64).unwrap_or(0);
                    counts.insert(name.clone(), json!(total + found as u64));
                    if self.redact {
                        let replacement = format!("[REDACTED:{}]", name);
                        text = pattern.replace_all(&text, replacement.as_str()).into_owned();
                    }
                }
                Value::String(text)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.scan(item, counts)).collect())
            }
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), self.scan(v, counts)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl NodeExecutor for PiiDetectionNode {
    fn node_type(&self) -> &str {
        NodeKind::PiiDetection.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("input")?;
        let mut counts = Map::new();
        let scanned = self.scan(input, &mut counts);

        let findings: Vec<Value> = counts
            .iter()
            .map(|(kind, count)| json!({"type": kind, "count": count}))
            .collect();
        if !findings.is_empty() {
            ctx.events
                .warn(format!("Detected {} kind(s) of personal data", findings.len()));
        }
        let output = if self.redact { scanned } else { input.clone() };
        let found = !findings.is_empty();
        Ok(NodeOutput::new()
            .with_output("output", output)
            .with_output("findings", Value::Array(findings))
            .with_metric("found", found))
    }
}

pub struct PiiDetectionNodeFactory;

impl ExecutorFactory for PiiDetectionNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        let names: Vec<String> = match config.get("patterns") {
            None | Some(Value::Null) => PII_PATTERNS.iter().map(|(n, _)| n.to_string()).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        NodeError::Configuration("'patterns' must list pattern names".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(NodeError::Configuration(
                    "'patterns' must be an array".to_string(),
                ))
            }
        };

        let mut patterns = Vec::with_capacity(names.len());
        for name in names {
            let source = PII_PATTERNS
                .iter()
                .find(|(known, _)| *known == name)
                .map(|(_, source)| *source)
                .ok_or_else(|| NodeError::Configuration(format!("unknown PII pattern '{}'", name)))?;
            let regex = Regex::new(source).map_err(|e| NodeError::Configuration(e.to_string()))?;
            patterns.push((name, regex));
        }

        Ok(Box::new(PiiDetectionNode {
            patterns,
            redact: config.get("redact").map(Value::truthy).unwrap_or(true),
        }))
    }

    fn node_type(&self) -> &str {
        NodeKind::PiiDetection.as_str()
    }
}
