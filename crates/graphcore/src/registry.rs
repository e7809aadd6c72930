use crate::definition::NodeDefinition;
use crate::error::RegistryError;
use std::collections::HashMap;

/// Catalog of node kinds available to graphs
///
/// Definitions are kept in registration order so listings are stable.
#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistry {
    definitions: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Fails if the type key is already taken.
    pub fn register(&mut self, definition: NodeDefinition) -> Result<(), RegistryError> {
        if self.index.contains_key(&definition.node_type) {
            return Err(RegistryError::DuplicateType(definition.node_type));
        }
        tracing::debug!("Registering node type: {}", definition.node_type);
        self.index
            .insert(definition.node_type.clone(), self.definitions.len());
        self.definitions.push(definition);
        Ok(())
    }

    pub fn get(&self, node_type: &str) -> Result<&NodeDefinition, RegistryError> {
        self.index
            .get(node_type)
            .map(|&i| &self.definitions[i])
            .ok_or_else(|| RegistryError::UnknownType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.index.contains_key(node_type)
    }

    /// Definitions in registration order, optionally filtered by category.
    ///
    /// The iterator is lazy and can be cloned to restart from the beginning.
    pub fn list<'a>(
        &'a self,
        category: Option<&'a str>,
    ) -> impl Iterator<Item = &'a NodeDefinition> + Clone + 'a {
        self.definitions
            .iter()
            .filter(move |def| category.map_or(true, |c| def.category == c))
    }

    /// Distinct categories in first-seen order
    pub fn categories(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for def in &self.definitions {
            if !seen.contains(&def.category.as_str()) {
                seen.push(def.category.as_str());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::category;

    fn registry() -> NodeTypeRegistry {
        let mut registry = NodeTypeRegistry::new();
        registry
            .register(NodeDefinition::new("input", category::IO))
            .unwrap();
        registry
            .register(NodeDefinition::new("delay", category::CONTROL))
            .unwrap();
        registry
            .register(NodeDefinition::new("output", category::IO))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register(NodeDefinition::new("delay", category::CONTROL))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateType("delay".into()));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_type_lookup_fails() {
        let registry = registry();
        assert!(registry.get("delay").is_ok());
        assert_eq!(
            registry.get("teleport").unwrap_err(),
            RegistryError::UnknownType("teleport".into())
        );
    }

    #[test]
    fn list_filters_and_restarts() {
        let registry = registry();
        let io = registry.list(Some(category::IO));
        let first: Vec<_> = io.clone().map(|d| d.node_type.as_str()).collect();
        let second: Vec<_> = io.map(|d| d.node_type.as_str()).collect();
        assert_eq!(first, vec!["input", "output"]);
        assert_eq!(first, second);
        assert_eq!(registry.list(None).count(), 3);
        assert_eq!(registry.categories(), vec!["io", "control"]);
    }
}
