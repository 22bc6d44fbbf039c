//! In-process registry of external SQL stores, keyed by store name.

use super::ExternalStore;
use crate::model::application::is_valid_name;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("store name is invalid: {0}")]
    InvalidStoreName(String),
    #[error("store already registered: {0}")]
    DuplicateStore(String),
}

/// External stores available to publish, resolved by data-store name.
#[derive(Default)]
pub struct ExternalStoreRegistry {
    stores: BTreeMap<String, Arc<dyn ExternalStore>>,
}

impl ExternalStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: Arc<dyn ExternalStore>) -> Result<(), RegistryError> {
        let name = store.name().trim().to_string();
        if !is_valid_name(&name) {
            return Err(RegistryError::InvalidStoreName(name));
        }
        if self.stores.contains_key(&name) {
            return Err(RegistryError::DuplicateStore(name));
        }
        self.stores.insert(name, store);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExternalStore>> {
        self.stores.get(name.trim()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name.trim())
    }

    /// Returns sorted store names.
    pub fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteExternalStore;

    fn store(name: &str) -> Arc<dyn ExternalStore> {
        Arc::new(SqliteExternalStore::in_memory(name).unwrap())
    }

    #[test]
    fn register_and_lookup_by_name() {
        let mut registry = ExternalStoreRegistry::new();
        registry.register(store("Sales")).unwrap();
        registry.register(store("Hr")).unwrap();

        assert_eq!(registry.names(), vec!["Hr".to_string(), "Sales".to_string()]);
        assert!(registry.get(" Sales ").is_some());
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let mut registry = ExternalStoreRegistry::new();
        registry.register(store("Sales")).unwrap();
        assert_eq!(
            registry.register(store("Sales")).unwrap_err(),
            RegistryError::DuplicateStore("Sales".to_string())
        );
        assert!(matches!(
            registry.register(store("bad name")),
            Err(RegistryError::InvalidStoreName(_))
        ));
    }
}
