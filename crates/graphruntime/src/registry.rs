use graphcore::{Config, FlowError, NodeContext, NodeError, NodeExecutor, NodeOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating executor instances
pub trait ExecutorFactory: Send + Sync {
    /// Create a new executor for one node instance with its effective configuration
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError>;

    /// Node kind served by this factory
    fn node_type(&self) -> &str;
}

/// Registry mapping node kinds to executor factories
pub struct ExecutorRegistry {
    factories: HashMap<String, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory, replacing any previous one for the same kind
    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("Registering executor for node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Register one executor instance that is shared by every node of its kind
    pub fn register_shared(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.register(Arc::new(SharedFactory {
            node_type: executor.node_type().to_string(),
            executor,
        }));
    }

    /// Create an executor for a node kind and validate its config
    pub fn create(&self, node_type: &str, config: &Config) -> Result<Arc<dyn NodeExecutor>, FlowError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| FlowError::MissingExecutor(node_type.to_string()))?;

        let executor: Arc<dyn NodeExecutor> = Arc::from(factory.create(config)?);
        executor.validate_config(config)?;
        Ok(executor)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Registered kinds, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SharedFactory {
    node_type: String,
    executor: Arc<dyn NodeExecutor>,
}

impl ExecutorFactory for SharedFactory {
    fn create(&self, _config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        Ok(Box::new(Shared(self.executor.clone())))
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }
}

struct Shared(Arc<dyn NodeExecutor>);

#[async_trait]
impl NodeExecutor for Shared {
    fn node_type(&self) -> &str {
        self.0.node_type()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.0.execute(ctx).await
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        self.0.validate_config(config)
    }
}
