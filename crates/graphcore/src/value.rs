use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Dynamic value flowing along edges and stored in node config
pub use serde_json::Value;

/// Values keyed by port name
pub type PortValues = HashMap<String, Value>;

/// Node configuration, keyed by option name
pub type Config = BTreeMap<String, Value>;

/// Data type carried by a port. Loosely checked: `Any` is compatible with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Object,
    Array,
    Message,
}

impl DataType {
    pub fn compatible_with(self, other: DataType) -> bool {
        self == other || self == DataType::Any || other == DataType::Any
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Any => "any",
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Object => "object",
            DataType::Array => "array",
            DataType::Message => "message",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a config option in a node's config schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ConfigType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ConfigType::Any => true,
            ConfigType::String => value.is_string(),
            ConfigType::Number => value.is_number(),
            ConfigType::Boolean => value.is_boolean(),
            ConfigType::Object => value.is_object(),
            ConfigType::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigType::String => "string",
            ConfigType::Number => "number",
            ConfigType::Boolean => "boolean",
            ConfigType::Object => "object",
            ConfigType::Array => "array",
            ConfigType::Any => "any",
        }
    }
}

/// Helpers over dynamic values used by executors and the predicate language
pub trait ValueExt {
    /// JSON type name, used in error messages
    fn type_name(&self) -> &'static str;

    /// Resolve a dotted path (`user.tags.0`) inside objects and arrays
    fn lookup(&self, path: &str) -> Option<&Value>;

    /// Loose truthiness: null, false, 0, "" and empty collections are false
    fn truthy(&self) -> bool;
}

impl ValueExt for Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }
}
