//! Uploader classes
//!
//! An [`Uploader`] is a named, independently configurable class: its own
//! plugin stack, attacher settings and processors. Deriving a class copies
//! its definition, so plugins loaded into the derived class never leak
//! back into the parent.

use std::sync::Arc;
use std::time::Instant;

use attache_core::config::AttacherConfig;
use attache_core::{metadata_keys, Action, Context, Metadata, Options, RecordRef};
use attache_storage::{BoxIo, PresignedRequest, Storage, StorageRegistry, UploadIo, CHUNK_SIZE};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::error::{AttacheError, AttacheResult, StorageOperation};
use crate::plugin::chain::LayerStack;
use crate::plugin::{
    AttacherLayer, FileLayer, FileNext, PluginRegistry, Processed, Target, UploaderLayer,
    UploaderNext,
};
use crate::plugins::backgrounding::{BackgroundHook, BackgroundHooks};
use crate::plugins::processing::Processor;
use crate::uploaded_file::{extension_of, UploadedFile, UploadedFileIo};

/// Storages and checks an attacher uses by default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttacherSettings {
    pub cache: String,
    pub store: String,
    pub verify_cached_existence: bool,
}

impl Default for AttacherSettings {
    fn default() -> Self {
        AttacherSettings::from(&AttacherConfig::default())
    }
}

impl From<&AttacherConfig> for AttacherSettings {
    fn from(config: &AttacherConfig) -> Self {
        Self {
            cache: config.cache.clone(),
            store: config.store.clone(),
            verify_cached_existence: config.verify_cached_existence,
        }
    }
}

#[derive(Debug, Clone)]
struct LoadedPlugin {
    name: String,
    options: Options,
}

#[derive(Clone)]
struct ClassDef {
    name: String,
    storages: StorageRegistry,
    registry: PluginRegistry,
    plugins: Vec<LoadedPlugin>,
    uploader_layers: LayerStack<dyn UploaderLayer>,
    attacher_layers: LayerStack<dyn AttacherLayer>,
    file_layers: LayerStack<dyn FileLayer>,
    attacher: AttacherSettings,
    processors: IndexMap<Action, Vec<Arc<dyn Processor>>>,
    background: BackgroundHooks,
}

impl ClassDef {
    fn loaded(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.iter().find(|plugin| plugin.name == name)
    }

    /// Load a plugin and its missing dependencies, dependencies first
    fn load(&mut self, name: &str, options: Options, loading: &mut Vec<String>) -> AttacheResult<()> {
        if loading.iter().any(|pending| pending == name) {
            return Err(AttacheError::plugin_load(
                name,
                format!("dependency cycle: {} -> {}", loading.join(" -> "), name),
            ));
        }

        let plugin = self.registry.get(name)?;
        let targets = plugin.targets();
        if targets.is_empty() {
            return Err(AttacheError::plugin_load(name, "plugin declares no targets"));
        }

        loading.push(name.to_string());
        for dependency in plugin.dependencies() {
            if self.loaded(&dependency.name).is_none() {
                self.load(&dependency.name, dependency.options, loading)?;
            }
        }
        loading.pop();

        let merged = match self.loaded(name) {
            Some(loaded) => merge_options(&loaded.options, options),
            None => merge_options(&plugin.default_options(), options),
        };
        let layers = plugin
            .build(&merged)
            .map_err(|message| AttacheError::plugin_load(name, message))?;

        for target in [Target::Uploader, Target::Attacher, Target::File] {
            let declared = targets.contains(&target);
            let provided = layers.provides(target);
            if declared && !provided {
                return Err(AttacheError::plugin_load(
                    name,
                    format!("no {} layer provided", target),
                ));
            }
            if provided && !declared {
                return Err(AttacheError::plugin_load(
                    name,
                    format!("{} layer provided for undeclared target", target),
                ));
            }
        }

        install(&mut self.uploader_layers, name, layers.uploader);
        install(&mut self.attacher_layers, name, layers.attacher);
        install(&mut self.file_layers, name, layers.file);

        match self.plugins.iter_mut().find(|plugin| plugin.name == name) {
            Some(loaded) => loaded.options = merged,
            None => self.plugins.push(LoadedPlugin {
                name: name.to_string(),
                options: merged,
            }),
        }

        debug!(uploader = %self.name, plugin = name, "Plugin layers installed");
        Ok(())
    }
}

/// Replace the plugin's layer in place, or append it on first load
fn install<L: ?Sized>(stack: &mut LayerStack<L>, name: &str, layer: Option<Arc<L>>) {
    if let Some(layer) = layer {
        match stack.iter_mut().find(|(owner, _)| owner == name) {
            Some(entry) => entry.1 = layer,
            None => stack.push((name.to_string(), layer)),
        }
    }
}

/// Shallow merge; keys in `overrides` win
fn merge_options(base: &Options, overrides: Options) -> Options {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key, value);
    }
    merged
}

/// `<uuid><.ext>`, the extension taken from the original filename
pub(crate) fn random_location(metadata: &Metadata, _ctx: &Context) -> String {
    let extension = metadata
        .get(metadata_keys::FILENAME)
        .and_then(Value::as_str)
        .and_then(extension_of)
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();
    format!("{}{}", Uuid::new_v4().simple(), extension)
}

/// `photo.jpg` + `thumb` becomes `photo-thumb.jpg`
fn versioned_location(location: &str, version: &str) -> String {
    let (dir, file) = match location.rfind('/') {
        Some(index) => location.split_at(index + 1),
        None => ("", location),
    };
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}-{}{}", dir, &file[..dot], version, &file[dot..]),
        _ => format!("{}-{}", location, version),
    }
}

/// Named uploader class
#[derive(Clone)]
pub struct Uploader {
    def: Arc<ClassDef>,
}

impl Uploader {
    /// New class using the process-wide storage and plugin registries
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registries(name, StorageRegistry::global(), PluginRegistry::global())
    }

    pub fn with_registries(
        name: impl Into<String>,
        storages: StorageRegistry,
        registry: PluginRegistry,
    ) -> Self {
        Self {
            def: Arc::new(ClassDef {
                name: name.into(),
                storages,
                registry,
                plugins: Vec::new(),
                uploader_layers: Vec::new(),
                attacher_layers: Vec::new(),
                file_layers: Vec::new(),
                attacher: AttacherSettings::default(),
                processors: IndexMap::new(),
                background: BackgroundHooks::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Independent copy of this class under a new name
    pub fn derive(&self, name: impl Into<String>) -> Uploader {
        let mut def = (*self.def).clone();
        def.name = name.into();
        Uploader { def: Arc::new(def) }
    }

    fn def_mut(&mut self) -> &mut ClassDef {
        Arc::make_mut(&mut self.def)
    }

    /// Load a plugin into this class
    ///
    /// Missing dependencies are loaded first with their default options.
    /// Loading an already loaded plugin merges the new options over the
    /// current ones and rebuilds its layers in place. On error the class is
    /// left exactly as it was.
    #[instrument(skip(self, options), fields(uploader = %self.def.name))]
    pub fn plugin(&mut self, name: &str, options: Options) -> AttacheResult<&mut Self> {
        let mut def = (*self.def).clone();
        let mut loading = Vec::new();
        def.load(name, options, &mut loading)?;
        self.def = Arc::new(def);

        info!(plugin = name, "Plugin loaded");
        Ok(self)
    }

    /// Builder form of [`Uploader::plugin`]
    pub fn with_plugin(mut self, name: &str, options: Options) -> AttacheResult<Self> {
        self.plugin(name, options)?;
        Ok(self)
    }

    pub fn is_loaded(&self, plugin: &str) -> bool {
        self.def.loaded(plugin).is_some()
    }

    /// Loaded plugin names in load order
    pub fn plugins(&self) -> Vec<&str> {
        self.def.plugins.iter().map(|plugin| plugin.name.as_str()).collect()
    }

    /// Effective options of a loaded plugin
    pub fn plugin_options(&self, plugin: &str) -> Option<&Options> {
        self.def.loaded(plugin).map(|loaded| &loaded.options)
    }

    pub(crate) fn require(&self, plugin: &str) -> AttacheResult<()> {
        if self.is_loaded(plugin) {
            Ok(())
        } else {
            Err(AttacheError::plugin_load(
                plugin,
                format!("plugin is not loaded into {}", self.def.name),
            ))
        }
    }

    pub fn attacher_settings(&self) -> &AttacherSettings {
        &self.def.attacher
    }

    pub fn configure(&mut self, config: &AttacherConfig) -> &mut Self {
        self.def_mut().attacher = AttacherSettings::from(config);
        self
    }

    pub fn cache_storage(&mut self, name: impl Into<String>) -> &mut Self {
        self.def_mut().attacher.cache = name.into();
        self
    }

    pub fn store_storage(&mut self, name: impl Into<String>) -> &mut Self {
        self.def_mut().attacher.store = name.into();
        self
    }

    pub fn verify_cached_existence(&mut self, verify: bool) -> &mut Self {
        self.def_mut().attacher.verify_cached_existence = verify;
        self
    }

    pub fn storages(&self) -> &StorageRegistry {
        &self.def.storages
    }

    pub fn storage(&self, name: &str) -> AttacheResult<Arc<dyn Storage>> {
        self.def
            .storages
            .get(name)
            .map_err(|_| AttacheError::UnknownStorage(name.to_string()))
    }

    /// Attacher for an attribute of `record`
    pub fn attacher(&self, record: RecordRef, name: impl Into<String>) -> Attacher {
        Attacher::new(self.clone(), record, name)
    }

    pub(crate) fn attacher_layers(&self) -> &LayerStack<dyn AttacherLayer> {
        &self.def.attacher_layers
    }

    fn uploader_chain(&self) -> UploaderNext<'_> {
        UploaderNext::new(self, &self.def.uploader_layers)
    }

    // Hook entry points, resolved from the top of the plugin stack

    /// Process and store `io` on `storage`; the stream is closed afterwards
    pub async fn upload(&self, io: BoxIo, storage: &str, ctx: &Context) -> AttacheResult<AttachmentData> {
        self.uploader_chain().upload(io, storage, ctx).await
    }

    pub async fn process(&self, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Option<Processed>> {
        self.uploader_chain().process(io, ctx).await
    }

    pub async fn store_processed(
        &self,
        processed: Processed,
        storage: &str,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        self.uploader_chain()
            .store_processed(processed, storage, ctx)
            .await
    }

    pub async fn extract_metadata(&self, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Metadata> {
        self.uploader_chain().extract_metadata(io, ctx).await
    }

    pub fn generate_location(&self, metadata: &Metadata, ctx: &Context) -> String {
        self.uploader_chain().generate_location(metadata, ctx)
    }

    pub async fn delete(&self, file: &UploadedFile, ctx: &Context) -> AttacheResult<()> {
        self.uploader_chain().delete(file, ctx).await
    }

    pub async fn url(&self, file: &UploadedFile, options: &Options) -> AttacheResult<String> {
        FileNext::new(self, &self.def.file_layers)
            .url(file, options)
            .await
    }

    /// Store a single stream without processing it
    ///
    /// Extracts metadata, picks a location (the context's explicit location,
    /// suffixed with the version when set, or a generated one) and writes the
    /// bytes. The stream is left open.
    pub async fn upload_file(
        &self,
        io: &mut dyn UploadIo,
        storage_name: &str,
        ctx: &Context,
    ) -> AttacheResult<UploadedFile> {
        let storage = self.storage(storage_name)?;

        io.rewind().await?;
        let metadata = self.extract_metadata(io, ctx).await?;
        io.rewind().await?;

        let id = match (&ctx.location, &ctx.version) {
            (Some(location), Some(version)) => versioned_location(location, version),
            (Some(location), None) => location.clone(),
            (None, _) => self.generate_location(&metadata, ctx),
        };

        let upload_options = ctx
            .get("upload_options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let started = Instant::now();
        storage
            .put(&id, io, &upload_options)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Put, storage_name, e))?;

        debug!(
            uploader = %self.def.name,
            storage = storage_name,
            id = %id,
            action = %ctx.action,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "File stored"
        );

        Ok(UploadedFile::new(id, storage_name, metadata))
    }

    /// Open a stored file for reading
    pub async fn open(&self, file: &UploadedFile) -> AttacheResult<BoxIo> {
        let storage = self.storage(&file.storage_name)?;
        let inner = storage
            .open(&file.id)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Open, &file.storage_name, e))?;
        Ok(Box::new(UploadedFileIo::new(inner, file.clone())))
    }

    pub async fn exists(&self, file: &UploadedFile) -> AttacheResult<bool> {
        let storage = self.storage(&file.storage_name)?;
        storage
            .exists(&file.id)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Exists, &file.storage_name, e))
    }

    /// Re-extract metadata from the stored content
    ///
    /// Refreshed keys overwrite the existing ones; keys the extraction does
    /// not produce are kept.
    pub async fn refresh_metadata(&self, file: &UploadedFile, ctx: &Context) -> AttacheResult<UploadedFile> {
        let storage = self.storage(&file.storage_name)?;
        let inner = storage
            .open(&file.id)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Open, &file.storage_name, e))?;

        let mut io = UploadedFileIo::for_refresh(inner, file.clone());
        let refreshed = self.extract_metadata(&mut io, ctx).await;
        if let Err(e) = io.close().await {
            warn!(id = %file.id, error = %e, "Failed to close stream after refreshing metadata");
        }

        let mut updated = file.clone();
        for (key, value) in refreshed? {
            updated.metadata.insert(key, value);
        }
        Ok(updated)
    }

    /// Location and request parameters for a direct client upload
    pub async fn presign(
        &self,
        storage_name: &str,
        filename: Option<&str>,
        options: &Options,
    ) -> AttacheResult<(String, PresignedRequest)> {
        let storage = self.storage(storage_name)?;
        let mut metadata = Metadata::new();
        if let Some(filename) = filename {
            metadata.insert(metadata_keys::FILENAME.to_string(), Value::from(filename));
        }

        let location = self.generate_location(&metadata, &Context::new(Action::Cache));
        let request = storage
            .presign(&location, options)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Presign, storage_name, e))?;
        Ok((location, request))
    }

    // Processing and backgrounding registration

    /// Register a processor for an action
    pub fn add_processor(&mut self, action: Action, processor: Arc<dyn Processor>) -> AttacheResult<&mut Self> {
        self.require("processing")?;
        self.def_mut()
            .processors
            .entry(action)
            .or_default()
            .push(processor);
        Ok(self)
    }

    /// Processors registered for an action, in registration order
    pub fn processors(&self, action: Action) -> &[Arc<dyn Processor>] {
        self.def
            .processors
            .get(&action)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Hand promotions to `hook` instead of running them inline
    pub fn promote_block(&mut self, hook: BackgroundHook) -> AttacheResult<&mut Self> {
        self.require("backgrounding")?;
        self.def_mut().background.promote = Some(hook);
        Ok(self)
    }

    /// Hand deletions of detached files to `hook`
    pub fn destroy_block(&mut self, hook: BackgroundHook) -> AttacheResult<&mut Self> {
        self.require("backgrounding")?;
        self.def_mut().background.destroy = Some(hook);
        Ok(self)
    }

    pub(crate) fn background_hooks(&self) -> &BackgroundHooks {
        &self.def.background
    }

    // Base behavior, reached when no layer overrides a hook

    pub(crate) async fn base_upload(
        &self,
        mut io: BoxIo,
        storage: &str,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        if io.is_closed() {
            return Err(AttacheError::InvalidIo(
                "cannot upload a closed stream".to_string(),
            ));
        }

        let result = self.upload_stream(io.as_mut(), storage, ctx).await;
        if let Err(e) = io.close().await {
            warn!(uploader = %self.def.name, error = %e, "Failed to close upload stream");
        }
        result
    }

    async fn upload_stream(
        &self,
        io: &mut dyn UploadIo,
        storage: &str,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        // Unknown storages fail before any processing work
        self.storage(storage)?;

        match self.process(io, ctx).await? {
            None => self
                .upload_file(io, storage, ctx)
                .await
                .map(AttachmentData::Single),
            Some(processed) => self.store_processed(processed, storage, ctx).await,
        }
    }

    pub(crate) async fn base_store_processed(
        &self,
        mut processed: Processed,
        storage: &str,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        let result = match &mut processed {
            Processed::Single(io) => self
                .upload_file(io.as_mut(), storage, ctx)
                .await
                .map(AttachmentData::Single),
            Processed::Versions(_) => Err(AttacheError::InvalidInput(
                "processing produced versions but the versions plugin is not loaded".to_string(),
            )),
        };
        if let Err(e) = processed.close().await {
            warn!(uploader = %self.def.name, error = %e, "Failed to close processed stream");
        }
        result
    }

    pub(crate) async fn base_extract_metadata(&self, io: &mut dyn UploadIo) -> AttacheResult<Metadata> {
        if let Some(stored) = io.stored_metadata() {
            let mut metadata = stored.clone();
            for key in [metadata_keys::FILENAME, metadata_keys::MIME_TYPE, metadata_keys::SIZE] {
                metadata.entry(key.to_string()).or_insert(Value::Null);
            }
            return Ok(metadata);
        }

        let mut metadata = Metadata::new();
        metadata.insert(
            metadata_keys::FILENAME.to_string(),
            io.original_filename().map(Value::from).unwrap_or(Value::Null),
        );
        metadata.insert(
            metadata_keys::MIME_TYPE.to_string(),
            io.content_type().map(Value::from).unwrap_or(Value::Null),
        );

        let size = match io.size() {
            Some(size) => size,
            None => {
                let mut total = 0u64;
                while let Some(chunk) = io.read_chunk(CHUNK_SIZE).await? {
                    total += chunk.len() as u64;
                }
                io.rewind().await?;
                total
            }
        };
        metadata.insert(metadata_keys::SIZE.to_string(), Value::from(size));

        Ok(metadata)
    }

    pub(crate) async fn base_delete(&self, file: &UploadedFile) -> AttacheResult<()> {
        let storage = self.storage(&file.storage_name)?;
        storage
            .delete(&file.id)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Delete, &file.storage_name, e))?;

        debug!(uploader = %self.def.name, storage = %file.storage_name, id = %file.id, "File deleted");
        Ok(())
    }

    pub(crate) async fn base_url(&self, file: &UploadedFile, options: &Options) -> AttacheResult<String> {
        let storage = self.storage(&file.storage_name)?;
        storage
            .url(&file.id, options)
            .await
            .map_err(|e| AttacheError::storage(StorageOperation::Url, &file.storage_name, e))
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("name", &self.def.name)
            .field("plugins", &self.plugins())
            .field("attacher", &self.def.attacher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Dependency, Plugin, PluginLayers};
    use crate::testing::{memory_uploader, options, CountingStorage};
    use attache_storage::{BytesIo, MemoryStorage};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;

    /// Stream of unknown length that records whether it was closed
    struct UnsizedIo {
        inner: BytesIo,
    }

    #[async_trait]
    impl UploadIo for UnsizedIo {
        async fn read_chunk(&mut self, max: usize) -> std::io::Result<Option<Bytes>> {
            self.inner.read_chunk(max).await
        }

        async fn rewind(&mut self) -> std::io::Result<()> {
            self.inner.rewind().await
        }

        fn is_eof(&self) -> bool {
            self.inner.is_eof()
        }

        async fn close(&mut self) -> std::io::Result<()> {
            self.inner.close().await
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    struct Marker {
        name: &'static str,
        deps: Vec<&'static str>,
    }

    struct MarkerLayer {
        tag: String,
    }

    impl UploaderLayer for MarkerLayer {
        fn generate_location(&self, metadata: &Metadata, ctx: &Context, next: UploaderNext<'_>) -> String {
            format!("{}/{}", self.tag, next.generate_location(metadata, ctx))
        }
    }

    impl Plugin for Marker {
        fn name(&self) -> &str {
            self.name
        }

        fn targets(&self) -> Vec<Target> {
            vec![Target::Uploader]
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.deps.iter().map(|name| Dependency::new(*name)).collect()
        }

        fn default_options(&self) -> Options {
            options(json!({"tag": self.name, "size": "small"}))
        }

        fn build(&self, options: &Options) -> Result<PluginLayers, String> {
            let tag = options
                .get("tag")
                .and_then(Value::as_str)
                .ok_or("tag is required")?;
            Ok(PluginLayers::new().uploader(MarkerLayer { tag: tag.to_string() }))
        }
    }

    fn marker_uploader(markers: Vec<Marker>) -> Uploader {
        let registry = PluginRegistry::new();
        for marker in markers {
            registry.register(Arc::new(marker)).unwrap();
        }
        let storages = StorageRegistry::new().with("cache", Arc::new(MemoryStorage::new()));
        Uploader::with_registries("Marked", storages, registry)
    }

    #[tokio::test]
    async fn test_upload_raw_stream() {
        let (uploader, cache, _) = memory_uploader();
        let io = BytesIo::new("0123456789").with_filename("hello.txt").boxed();

        let data = uploader
            .upload(io, "cache", &Context::new(Action::Cache))
            .await
            .unwrap();
        let file = data.main_file().unwrap();

        assert_eq!(file.storage_name, "cache");
        assert_eq!(file.filename(), Some("hello.txt"));
        assert_eq!(file.size(), Some(10));
        assert!(file.metadata.contains_key("mime_type"));
        assert!(file.id.ends_with(".txt"));
        assert_eq!(&cache.read(&file.id).await.unwrap()[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_upload_counts_unknown_size_and_closes() {
        let (uploader, _, _) = memory_uploader();
        let mut io = UnsizedIo {
            inner: BytesIo::new("abcdef"),
        };

        let file = uploader
            .upload_file(&mut io, "cache", &Context::new(Action::Cache))
            .await
            .unwrap();
        assert_eq!(file.size(), Some(6));
        assert!(!io.is_closed());

        let data = uploader
            .upload(Box::new(io), "store", &Context::new(Action::Store))
            .await
            .unwrap();
        assert_eq!(data.main_file().unwrap().size(), Some(6));
    }

    #[tokio::test]
    async fn test_upload_closed_stream() {
        let (uploader, cache, _) = memory_uploader();
        let mut io = BytesIo::new("data");
        io.close().await.unwrap();

        let result = uploader
            .upload(Box::new(io), "cache", &Context::new(Action::Cache))
            .await;
        assert!(matches!(result, Err(AttacheError::InvalidIo(_))));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_upload_unknown_storage() {
        let (uploader, _, _) = memory_uploader();
        let result = uploader
            .upload(BytesIo::new("x").boxed(), "s3", &Context::new(Action::Cache))
            .await;
        assert!(matches!(result, Err(AttacheError::UnknownStorage(name)) if name == "s3"));
    }

    #[tokio::test]
    async fn test_storage_errors_are_wrapped() {
        let (uploader, _, _) = memory_uploader();
        let failing = Arc::new(CountingStorage::new().failing_puts());
        uploader.storages().register("broken", failing);

        let result = uploader
            .upload(BytesIo::new("x").boxed(), "broken", &Context::new(Action::Cache))
            .await;
        match result {
            Err(AttacheError::Storage {
                operation, storage, ..
            }) => {
                assert_eq!(operation, StorageOperation::Put);
                assert_eq!(storage, "broken");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_explicit_location_and_version_suffix() {
        let (uploader, _, store) = memory_uploader();
        let ctx = Context::new(Action::Store).location("photos/1/image.jpg");

        let mut io = BytesIo::new("original");
        let file = uploader.upload_file(&mut io, "store", &ctx).await.unwrap();
        assert_eq!(file.id, "photos/1/image.jpg");

        let mut io = BytesIo::new("thumb");
        let file = uploader
            .upload_file(&mut io, "store", &ctx.with_version("thumb"))
            .await
            .unwrap();
        assert_eq!(file.id, "photos/1/image-thumb.jpg");
        assert_eq!(store.len().await, 2);
    }

    #[test]
    fn test_versioned_location() {
        assert_eq!(versioned_location("a/b.jpg", "small"), "a/b-small.jpg");
        assert_eq!(versioned_location("noext", "small"), "noext-small");
        assert_eq!(versioned_location("dir.d/file", "small"), "dir.d/file-small");
        assert_eq!(versioned_location(".hidden", "small"), ".hidden-small");
    }

    #[tokio::test]
    async fn test_open_and_refresh_metadata() {
        let (uploader, _, _) = memory_uploader();
        let io = BytesIo::new("hello").with_filename("a.txt").boxed();
        let data = uploader
            .upload(io, "cache", &Context::new(Action::Cache))
            .await
            .unwrap();
        let mut file = data.main_file().unwrap().clone();

        assert!(uploader.exists(&file).await.unwrap());
        let mut opened = uploader.open(&file).await.unwrap();
        assert_eq!(opened.original_filename(), Some("a.txt"));
        assert_eq!(&attache_storage::read_to_end(opened.as_mut()).await.unwrap()[..], b"hello");

        file.metadata.insert("size".to_string(), json!(999));
        file.metadata.insert("custom".to_string(), json!("kept"));
        let refreshed = uploader
            .refresh_metadata(&file, &Context::new(Action::Cache))
            .await
            .unwrap();
        assert_eq!(refreshed.size(), Some(5));
        assert_eq!(refreshed.get("custom"), Some(&json!("kept")));
    }

    #[tokio::test]
    async fn test_url_and_presign() {
        let (uploader, _, _) = memory_uploader();
        let file = UploadedFile::new("a.txt", "store", Metadata::new());
        assert_eq!(
            uploader.url(&file, &Options::new()).await.unwrap(),
            "memory://a.txt"
        );

        let (location, request) = uploader
            .presign("cache", Some("photo.PNG"), &Options::new())
            .await
            .unwrap();
        assert!(location.ends_with(".png"));
        assert_eq!(request.method, "PUT");
    }

    #[test]
    fn test_unknown_plugin_leaves_class_unchanged() {
        let (mut uploader, _, _) = memory_uploader();
        uploader.plugin("signature", Options::new()).unwrap();

        let err = uploader.plugin("does_not_exist", Options::new()).unwrap_err();
        assert!(matches!(err, AttacheError::PluginNotFound(_)));
        assert_eq!(uploader.plugins(), vec!["signature"]);
    }

    #[test]
    fn test_dependencies_load_first() {
        let mut uploader = marker_uploader(vec![
            Marker { name: "base", deps: vec![] },
            Marker { name: "top", deps: vec!["base"] },
        ]);
        uploader.plugin("top", Options::new()).unwrap();

        assert_eq!(uploader.plugins(), vec!["base", "top"]);
        let location = uploader.generate_location(&Metadata::new(), &Context::new(Action::Cache));
        assert!(location.starts_with("top/base/"));
    }

    #[test]
    fn test_dependency_loading_is_confluent() {
        let markers = || {
            vec![
                Marker { name: "base", deps: vec![] },
                Marker { name: "top", deps: vec!["base"] },
            ]
        };

        let mut implicit = marker_uploader(markers());
        implicit.plugin("top", Options::new()).unwrap();

        let mut explicit = marker_uploader(markers());
        explicit.plugin("base", Options::new()).unwrap();
        explicit.plugin("top", Options::new()).unwrap();

        assert_eq!(implicit.plugins(), explicit.plugins());
        assert_eq!(implicit.plugin_options("base"), explicit.plugin_options("base"));
        assert_eq!(implicit.plugin_options("top"), explicit.plugin_options("top"));
    }

    #[test]
    fn test_reload_merges_options_and_replaces_layer() {
        let mut uploader = marker_uploader(vec![Marker { name: "base", deps: vec![] }]);
        uploader.plugin("base", options(json!({"tag": "first"}))).unwrap();
        uploader.plugin("base", options(json!({"size": "large"}))).unwrap();

        let opts = uploader.plugin_options("base").unwrap();
        assert_eq!(opts.get("tag"), Some(&json!("first")));
        assert_eq!(opts.get("size"), Some(&json!("large")));
        assert_eq!(uploader.plugins(), vec!["base"]);

        let location = uploader.generate_location(&Metadata::new(), &Context::new(Action::Cache));
        assert!(location.starts_with("first/"));
        assert!(!location.starts_with("first/first/"));
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let mut uploader = marker_uploader(vec![
            Marker { name: "a", deps: vec!["b"] },
            Marker { name: "b", deps: vec!["a"] },
        ]);
        let err = uploader.plugin("a", Options::new()).unwrap_err();
        assert!(matches!(err, AttacheError::PluginLoad { .. }));
        assert!(uploader.plugins().is_empty());
    }

    #[test]
    fn test_build_failure_is_atomic() {
        let mut uploader = marker_uploader(vec![
            Marker { name: "base", deps: vec![] },
            Marker { name: "top", deps: vec!["base"] },
        ]);
        let err = uploader
            .plugin("top", options(json!({"tag": null})))
            .unwrap_err();
        assert!(matches!(err, AttacheError::PluginLoad { plugin, .. } if plugin == "top"));
        assert!(uploader.plugins().is_empty());
    }

    #[test]
    fn test_derived_class_isolation() {
        let (parent, _, _) = memory_uploader();
        let mut child = parent.derive("ImageUploader");
        child.plugin("signature", Options::new()).unwrap();
        child.store_storage("permanent");

        assert_eq!(child.name(), "ImageUploader");
        assert!(child.is_loaded("signature"));
        assert!(!parent.is_loaded("signature"));
        assert_eq!(parent.attacher_settings().store, "store");
        assert_eq!(child.attacher_settings().store, "permanent");
    }

    #[test]
    fn test_missing_dependency_leaves_class_unchanged() {
        let mut uploader = marker_uploader(vec![
            Marker { name: "base", deps: vec![] },
            Marker { name: "top", deps: vec!["base", "ghost"] },
        ]);

        let err = uploader.plugin("top", Options::new()).unwrap_err();
        assert!(matches!(err, AttacheError::PluginNotFound(ref name) if name == "ghost"));
        assert!(uploader.plugins().is_empty());
        assert!(uploader.plugin_options("base").is_none());
    }

    #[test]
    fn test_sibling_classes_are_isolated() {
        let mut parent = marker_uploader(vec![
            Marker { name: "base", deps: vec![] },
            Marker { name: "top", deps: vec!["base"] },
        ]);
        parent.plugin("base", options(json!({"tag": "shared"}))).unwrap();

        let mut first = parent.derive("FirstUploader");
        let second = parent.derive("SecondUploader");
        first.plugin("top", Options::new()).unwrap();
        first.plugin("base", options(json!({"size": "large"}))).unwrap();

        assert_eq!(first.plugins(), vec!["base", "top"]);
        assert_eq!(second.plugins(), vec!["base"]);
        assert_eq!(parent.plugins(), vec!["base"]);

        let second_opts = second.plugin_options("base").unwrap();
        assert_eq!(second_opts.get("tag"), Some(&json!("shared")));
        assert_eq!(second_opts.get("size"), Some(&json!("small")));
        assert_eq!(
            first.plugin_options("base").unwrap().get("size"),
            Some(&json!("large"))
        );

        let location = second.generate_location(&Metadata::new(), &Context::new(Action::Cache));
        assert!(location.starts_with("shared/"));
        assert!(!location.starts_with("top/"));
    }

    #[test]
    fn test_registration_requires_plugin() {
        let (mut uploader, _, _) = memory_uploader();
        let processor = crate::plugins::processing::from_fn(|_, _| Ok(None));
        assert!(matches!(
            uploader.add_processor(Action::Store, processor),
            Err(AttacheError::PluginLoad { .. })
        ));

        let hook = crate::plugins::backgrounding::hook(|_| async { Ok(()) });
        assert!(uploader.promote_block(hook).is_err());
    }

    #[tokio::test]
    async fn test_versions_require_plugin() {
        let (uploader, cache, _) = memory_uploader();
        let mut versions = IndexMap::new();
        versions.insert("a".to_string(), BytesIo::new("a").boxed());

        let result = uploader
            .store_processed(
                Processed::Versions(versions),
                "cache",
                &Context::new(Action::Cache),
            )
            .await;
        assert!(matches!(result, Err(AttacheError::InvalidInput(_))));
        assert!(cache.is_empty().await);
    }
}
