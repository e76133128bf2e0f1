//! Named storage registry
//!
//! Uploaded files refer to their storage by name; the registry resolves that
//! name to a backend. It is configured at startup and read-mostly afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use crate::storage::{Storage, StorageError, StorageResult};

static GLOBAL: Lazy<StorageRegistry> = Lazy::new(StorageRegistry::new);

/// Shared map of storage name to backend
#[derive(Clone, Default)]
pub struct StorageRegistry {
    storages: Arc<RwLock<BTreeMap<String, Arc<dyn Storage>>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> StorageRegistry {
        GLOBAL.clone()
    }

    /// Register (or replace) a storage under a name
    pub fn register(&self, name: impl Into<String>, storage: Arc<dyn Storage>) {
        let name = name.into();
        info!(name = %name, backend = storage.name(), "Storage registered");
        self.storages.write().insert(name, storage);
    }

    /// Builder-style registration
    pub fn with(self, name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        self.register(name, storage);
        self
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn Storage>> {
        self.storages
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.storages.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.storages.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("storages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_register_and_get() {
        let registry = StorageRegistry::new()
            .with("cache", Arc::new(MemoryStorage::new()))
            .with("store", Arc::new(MemoryStorage::new()));

        assert!(registry.contains("cache"));
        assert_eq!(registry.names(), vec!["cache".to_string(), "store".to_string()]);
        assert_eq!(registry.get("store").unwrap().name(), "memory");
    }

    #[test]
    fn test_unknown_storage() {
        let registry = StorageRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(StorageError::NotRegistered(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_clones_share_storages() {
        let registry = StorageRegistry::new();
        let clone = registry.clone();
        clone.register("cache", Arc::new(MemoryStorage::new()));
        assert!(registry.contains("cache"));
    }
}
