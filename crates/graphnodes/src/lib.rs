//! Standard node library
//!
//! Definitions for every built-in node kind plus executors for all kinds the engine
//! can run on its own. Agent, tool, memory, retrieval, database and integration kinds
//! are host-supplied; [`register_echo_for_external`] fills them with stand-ins.

mod approval;
mod cache;
pub mod catalog;
mod control;
pub mod expr;
mod governance;
mod http;
mod io;
mod loops;
mod resilience;
mod time;
mod transform;

pub use approval::HumanApprovalNode;
pub use cache::{CacheNode, CacheNodeFactory};
pub use catalog::{definitions, register_definitions, EXTERNAL_KINDS};
pub use control::{
    ConditionNode, ConditionNodeFactory, JoinNode, MergeNode, ParallelNode, SwitchNode,
    SwitchNodeFactory,
};
pub use expr::Expr;
pub use governance::{
    AuditLogNode, CostGuardNode, PiiDetectionNode, PiiDetectionNodeFactory, SecretFetchNode,
    SecretFetchNodeFactory,
};
pub use http::{HttpNode, HttpNodeFactory, WebhookNode, WebhookNodeFactory};
pub use io::{EchoNode, EchoNodeFactory, InputNode, OutputNode};
pub use loops::LoopNode;
pub use resilience::{
    CircuitBreakerNode, CircuitBreakerNodeFactory, RateLimiterNode, RateLimiterNodeFactory,
    RetryNode, RetryNodeFactory,
};
pub use time::DelayNode;
pub use transform::{
    FilterNode, FilterNodeFactory, JsonParseNode, JsonStringifyNode, MapNode, SplitNode,
    TemplateNode, TemplateNodeFactory, TransformNode,
};

use graphcore::{NodeTypeRegistry, RegistryError};
use graphruntime::ExecutorRegistry;
use std::sync::Arc;

/// Register executors for every kind the engine runs itself
pub fn register_executors(registry: &mut ExecutorRegistry) {
    registry.register_shared(Arc::new(InputNode));
    registry.register_shared(Arc::new(OutputNode));

    registry.register(Arc::new(ConditionNodeFactory));
    registry.register(Arc::new(SwitchNodeFactory));
    registry.register_shared(Arc::new(LoopNode));
    registry.register_shared(Arc::new(ParallelNode));
    registry.register_shared(Arc::new(JoinNode));
    registry.register_shared(Arc::new(DelayNode));
    registry.register(Arc::new(RetryNodeFactory));
    registry.register(Arc::new(CircuitBreakerNodeFactory));
    registry.register(Arc::new(RateLimiterNodeFactory));

    registry.register_shared(Arc::new(TransformNode));
    registry.register_shared(Arc::new(MapNode));
    registry.register(Arc::new(FilterNodeFactory));
    registry.register_shared(Arc::new(MergeNode));
    registry.register_shared(Arc::new(SplitNode));
    registry.register(Arc::new(CacheNodeFactory));
    registry.register(Arc::new(TemplateNodeFactory));
    registry.register_shared(Arc::new(JsonParseNode));
    registry.register_shared(Arc::new(JsonStringifyNode));

    registry.register(Arc::new(HttpNodeFactory));
    registry.register(Arc::new(WebhookNodeFactory));

    registry.register_shared(Arc::new(HumanApprovalNode));
    registry.register_shared(Arc::new(AuditLogNode));
    registry.register(Arc::new(SecretFetchNodeFactory));
    registry.register_shared(Arc::new(CostGuardNode));
    registry.register(Arc::new(PiiDetectionNodeFactory));
}

/// Register all standard definitions and executors
pub fn register_all(
    types: &mut NodeTypeRegistry,
    executors: &mut ExecutorRegistry,
) -> Result<(), RegistryError> {
    register_definitions(types)?;
    register_executors(executors);
    Ok(())
}

/// Echo stand-ins for host-supplied kinds that have no executor yet
pub fn register_echo_for_external(types: &NodeTypeRegistry, executors: &mut ExecutorRegistry) {
    for kind in EXTERNAL_KINDS {
        if executors.contains(kind.as_str()) {
            continue;
        }
        if let Ok(definition) = types.get(kind.as_str()) {
            executors.register(Arc::new(EchoNodeFactory::for_definition(definition)));
        }
    }
}
