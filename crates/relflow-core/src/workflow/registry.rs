//! Explicit registry of workflow definitions by name.
//!
//! Definitions hold closures and cannot be persisted, so a restarted process
//! rebuilds them and registers them here; `Engine::resume` looks a stored
//! run's definition up by name. The registry is an ordinary value owned by
//! whoever wires the application together.

use dashmap::DashMap;
use thiserror::Error;

use super::definition::Definition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("workflow definition '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Concurrent name -> definition map.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: DashMap<String, Definition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its own name.
    pub fn register(&self, definition: Definition) -> Result<(), RegistryError> {
        let name = definition.name().to_string();
        match self.definitions.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyRegistered(name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(definition);
                tracing::debug!(definition = %name, "registered workflow definition");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Definition> {
        self.definitions.get(name).map(|d| d.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Definition> {
        self.definitions.remove(name).map(|(_, d)| d)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
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

    fn definition(name: &str) -> Definition {
        let mut b = Definition::builder(name);
        b.action("noop", (), |_ctx, ()| async move { Ok(()) }).unwrap();
        b.build()
    }

    #[test]
    fn register_and_get() {
        let registry = DefinitionRegistry::new();
        registry.register(definition("release-gopls")).unwrap();
        registry.register(definition("release-vscode-go")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("release-gopls").unwrap().name(), "release-gopls");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["release-gopls", "release-vscode-go"]);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = DefinitionRegistry::new();
        registry.register(definition("release")).unwrap();
        assert_eq!(
            registry.register(definition("release")),
            Err(RegistryError::AlreadyRegistered("release".to_string()))
        );
    }

    #[test]
    fn remove_allows_re_registration() {
        let registry = DefinitionRegistry::new();
        registry.register(definition("release")).unwrap();
        assert!(registry.remove("release").is_some());
        assert!(registry.is_empty());
        registry.register(definition("release")).unwrap();
    }
}
