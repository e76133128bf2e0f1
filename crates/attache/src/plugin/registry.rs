//! Plugin registry

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::Plugin;
use crate::error::{AttacheError, AttacheResult};

static GLOBAL: Lazy<PluginRegistry> = Lazy::new(PluginRegistry::with_builtins);

/// Name to plugin lookup used when loading plugins into a class
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<BTreeMap<String, Arc<dyn Plugin>>>>,
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        {
            let mut plugins = registry.plugins.write();
            for plugin in crate::plugins::builtins() {
                plugins.insert(plugin.name().to_string(), plugin);
            }
        }
        registry
    }

    /// Process-wide registry, seeded with the built-in plugins
    pub fn global() -> PluginRegistry {
        GLOBAL.clone()
    }

    /// Register a plugin under its own name, replacing any previous one
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> AttacheResult<()> {
        let name = plugin.name().to_string();
        if name.is_empty() {
            return Err(AttacheError::plugin_load("", "plugin name is empty"));
        }
        if plugin.targets().is_empty() {
            return Err(AttacheError::plugin_load(&name, "plugin declares no targets"));
        }

        tracing::debug!(plugin = %name, "Registering plugin");
        self.plugins.write().insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> AttacheResult<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AttacheError::PluginNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
