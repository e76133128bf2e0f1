//! Plugin composition
//!
//! A plugin contributes override layers to up to three targets: the
//! uploader, the attacher and the uploaded file. Layers are stacked in load
//! order; a layer sees the rest of the stack through its `next` argument and
//! either delegates to it or replaces it.

pub mod chain;
pub mod registry;

use std::sync::Arc;

use attache_core::Options;

pub use chain::{
    AttacherLayer, AttacherNext, FileLayer, FileNext, Processed, UploaderLayer, UploaderNext,
};
pub use registry::PluginRegistry;

/// Part of the system a plugin overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Uploader,
    Attacher,
    File,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Target::Uploader => "uploader",
            Target::Attacher => "attacher",
            Target::File => "file",
        };
        f.write_str(name)
    }
}

/// Plugin that must be loaded before the declaring one
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub options: Options,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Options::new(),
        }
    }

    pub fn with_options(name: impl Into<String>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Layers a plugin contributes, built from its merged options
#[derive(Clone, Default)]
pub struct PluginLayers {
    pub uploader: Option<Arc<dyn UploaderLayer>>,
    pub attacher: Option<Arc<dyn AttacherLayer>>,
    pub file: Option<Arc<dyn FileLayer>>,
}

impl PluginLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploader(mut self, layer: impl UploaderLayer + 'static) -> Self {
        self.uploader = Some(Arc::new(layer));
        self
    }

    pub fn attacher(mut self, layer: impl AttacherLayer + 'static) -> Self {
        self.attacher = Some(Arc::new(layer));
        self
    }

    pub fn file(mut self, layer: impl FileLayer + 'static) -> Self {
        self.file = Some(Arc::new(layer));
        self
    }

    pub(crate) fn provides(&self, target: Target) -> bool {
        match target {
            Target::Uploader => self.uploader.is_some(),
            Target::Attacher => self.attacher.is_some(),
            Target::File => self.file.is_some(),
        }
    }
}

/// Named behavior bundle loadable into an uploader class
pub trait Plugin: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Targets this plugin overrides; must not be empty
    fn targets(&self) -> Vec<Target>;

    /// Plugins loaded first, with the options used when loaded implicitly
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Options merged under the user-supplied ones on first load
    fn default_options(&self) -> Options {
        Options::new()
    }

    /// Build the layers for the given merged options
    fn build(&self, options: &Options) -> Result<PluginLayers, String>;
}

/// Read an optional string option
pub(crate) fn string_option<'a>(options: &'a Options, key: &str) -> Option<&'a str> {
    options.get(key).and_then(|value| value.as_str())
}

/// Read an optional list-of-strings option
pub(crate) fn string_list_option(options: &Options, key: &str) -> Result<Option<Vec<String>>, String> {
    match options.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("{} must contain only strings", key))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(format!("{} must be a list of strings", key)),
    }
}

/// Read an optional non-negative integer option
pub(crate) fn u64_option(options: &Options, key: &str) -> Result<Option<u64>, String> {
    match options.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("{} must be a non-negative integer", key)),
    }
}

/// Read an optional boolean option
pub(crate) fn bool_option(options: &Options, key: &str) -> Result<Option<bool>, String> {
    match options.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("{} must be a boolean", key)),
    }
}
