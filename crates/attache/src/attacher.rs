//! Attacher state machine
//!
//! An [`Attacher`] manages one attachment attribute of one record. Assigned
//! files are uploaded to the cache storage and validated; promotion moves
//! them to the store storage; replacing deletes the stored file the new one
//! superseded. The serialized column value always mirrors the current file.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use attache_core::{Action, Context, Options, RecordRef, ValidationErrors};
use attache_storage::{BoxIo, BytesIo, FileIo};

use crate::attachment::AttachmentData;
use crate::error::{AttacheError, AttacheResult};
use crate::model::ColumnStore;
use crate::plugin::AttacherNext;
use crate::plugins::backgrounding::{BackgroundAction, BackgroundPayload};
use crate::uploaded_file::UploadedFile;
use crate::uploader::Uploader;

/// Value assigned to an attachment attribute
pub enum AssignInput {
    /// Raw upload, cached and validated
    Io(BoxIo),
    /// Serialized reference to a file already on the cache storage
    Cached(String),
    /// Parsed reference to a file already on the cache storage
    CachedData(AttachmentData),
    /// Detach the current file
    Clear,
}

impl From<BoxIo> for AssignInput {
    fn from(io: BoxIo) -> Self {
        AssignInput::Io(io)
    }
}

impl From<BytesIo> for AssignInput {
    fn from(io: BytesIo) -> Self {
        AssignInput::Io(Box::new(io))
    }
}

impl From<FileIo> for AssignInput {
    fn from(io: FileIo) -> Self {
        AssignInput::Io(Box::new(io))
    }
}

impl From<String> for AssignInput {
    fn from(json: String) -> Self {
        AssignInput::Cached(json)
    }
}

impl From<&str> for AssignInput {
    fn from(json: &str) -> Self {
        AssignInput::Cached(json.to_string())
    }
}

impl From<AttachmentData> for AssignInput {
    fn from(data: AttachmentData) -> Self {
        AssignInput::CachedData(data)
    }
}

impl<T: Into<AssignInput>> From<Option<T>> for AssignInput {
    fn from(value: Option<T>) -> Self {
        value.map_or(AssignInput::Clear, Into::into)
    }
}

/// Attachment attribute of a single record
pub struct Attacher {
    uploader: Uploader,
    record: RecordRef,
    name: String,
    cache: String,
    store: String,
    file: Option<AttachmentData>,
    previous: Option<AttachmentData>,
    changed: bool,
    column: Option<String>,
    promoted: Vec<AttachmentData>,
}

impl Attacher {
    pub fn new(uploader: Uploader, record: RecordRef, name: impl Into<String>) -> Self {
        let settings = uploader.attacher_settings();
        let cache = settings.cache.clone();
        let store = settings.store.clone();
        Self {
            uploader,
            record,
            name: name.into(),
            cache,
            store,
            file: None,
            previous: None,
            changed: false,
            column: None,
            promoted: Vec::new(),
        }
    }

    /// Rebuild an attacher from a persisted column value
    pub fn from_column(
        uploader: Uploader,
        record: RecordRef,
        name: impl Into<String>,
        column: Option<&str>,
    ) -> AttacheResult<Self> {
        let mut attacher = Self::new(uploader, record, name);
        attacher.reload(column)?;
        Ok(attacher)
    }

    /// Override the class-level cache and store storages
    pub fn with_storages(mut self, cache: impl Into<String>, store: impl Into<String>) -> Self {
        self.cache = cache.into();
        self.store = store.into();
        self
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    /// Update the owning record, e.g. once a new record received its id
    pub fn set_record(&mut self, record: RecordRef) {
        self.record = record;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_key(&self) -> &str {
        &self.cache
    }

    pub fn store_key(&self) -> &str {
        &self.store
    }

    pub fn file(&self) -> Option<&AttachmentData> {
        self.file.as_ref()
    }

    /// Current file when it sits on the cache storage
    pub fn cached(&self) -> Option<&AttachmentData> {
        self.file.as_ref().filter(|data| data.is_on(&self.cache))
    }

    /// Current file when it sits on the store storage
    pub fn stored(&self) -> Option<&AttachmentData> {
        self.file.as_ref().filter(|data| data.is_on(&self.store))
    }

    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// File the pending change replaces
    pub fn previous(&self) -> Option<&AttachmentData> {
        self.previous.as_ref()
    }

    /// Serialized value to persist in the attachment column
    pub fn column_data(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn data(&self) -> Option<Value> {
        self.file.as_ref().map(AttachmentData::to_value)
    }

    /// Serialized cached reference, for re-submitting with a form
    pub fn cached_data(&self) -> Option<String> {
        self.cached().map(AttachmentData::to_json)
    }

    pub fn context(&self, action: Action) -> Context {
        Context::new(action)
            .record(self.record.clone())
            .name(self.name.clone())
    }

    fn needs_promotion(&self) -> bool {
        self.file
            .as_ref()
            .map_or(false, |data| !data.is_on(&self.store))
    }

    /// Reset state to a persisted column value, discarding pending changes
    pub fn reload(&mut self, column: Option<&str>) -> AttacheResult<()> {
        let file = match column {
            Some(json) => Some(
                AttachmentData::from_json(json)
                    .map_err(|e| AttacheError::CorruptColumn(format!("{}: {}", self.name, e)))?,
            ),
            None => None,
        };

        self.file = file;
        self.column = column.map(str::to_string);
        self.previous = None;
        self.changed = false;
        self.promoted.clear();
        Ok(())
    }

    /// Assign a new value
    ///
    /// Raw IO is uploaded to the cache storage; cached references must point
    /// at the cache storage. The new file is validated before it becomes the
    /// current one; on any error the attacher state is left unchanged.
    #[instrument(skip(self, input), fields(record = %self.record, name = %self.name))]
    pub async fn assign(&mut self, input: impl Into<AssignInput>) -> AttacheResult<()> {
        match input.into() {
            AssignInput::Io(io) => {
                let ctx = self.context(Action::Cache);
                let cached = self.uploader.upload(io, &self.cache, &ctx).await?;

                let errors = self.validate(&cached);
                if !errors.is_empty() {
                    self.delete_quietly(&cached).await;
                    return Err(AttacheError::ValidationFailed(errors));
                }

                debug!(ids = %cached.ids(), "Cached file assigned");
                self.change(Some(cached));
                Ok(())
            }
            // Empty form fields carry no value
            AssignInput::Cached(json) if json.trim().is_empty() => Ok(()),
            AssignInput::Cached(json) => {
                let data = AttachmentData::from_json(&json)?;
                self.attach_cached(data).await
            }
            AssignInput::CachedData(data) => self.attach_cached(data).await,
            AssignInput::Clear => {
                if self.file.is_some() {
                    self.change(None);
                }
                Ok(())
            }
        }
    }

    /// Assign a reference to a file already on the cache storage
    pub async fn attach_cached(&mut self, data: AttachmentData) -> AttacheResult<()> {
        data.check()?;
        if let Some(file) = data.files().into_iter().find(|file| !file.is_on(&self.cache)) {
            return Err(AttacheError::InvalidInput(format!(
                "expected a file on {}, got {} on {}",
                self.cache, file.id, file.storage_name
            )));
        }
        if self.file.as_ref() == Some(&data) {
            return Ok(());
        }

        let data = AttacherNext::new(self.uploader.attacher_layers())
            .assign_cached(self, data)
            .await?;

        let errors = self.validate(&data);
        if !errors.is_empty() {
            return Err(AttacheError::ValidationFailed(errors));
        }

        debug!(record = %self.record, name = %self.name, ids = %data.ids(), "Cached reference assigned");
        self.change(Some(data));
        Ok(())
    }

    /// Upload `io` straight to `storage` and make it the current file
    pub async fn attach(&mut self, io: BoxIo, storage: &str) -> AttacheResult<()> {
        let action = if storage == self.cache {
            Action::Cache
        } else {
            Action::Store
        };
        let data = self.uploader.upload(io, storage, &self.context(action)).await?;
        self.change(Some(data));
        Ok(())
    }

    /// Run validation hooks against a candidate file
    pub fn validate(&self, data: &AttachmentData) -> ValidationErrors {
        AttacherNext::new(self.uploader.attacher_layers()).validate(self, data)
    }

    /// Replace the current file, remembering the value the change started from
    fn change(&mut self, data: Option<AttachmentData>) {
        if !self.changed {
            self.previous = self.file.take();
            self.changed = true;
        }
        self.set(data);
    }

    /// Replace the current file without change tracking
    pub fn set(&mut self, data: Option<AttachmentData>) {
        self.column = data.as_ref().map(AttachmentData::to_json);
        self.file = data;
    }

    /// Promote the cached file, through the plugin stack
    ///
    /// Does nothing when the current file is absent or already stored.
    pub async fn promote(&mut self) -> AttacheResult<()> {
        if !self.needs_promotion() {
            return Ok(());
        }
        let uploader = self.uploader.clone();
        AttacherNext::new(uploader.attacher_layers())
            .promote(self)
            .await
    }

    /// Upload the cached file to the store storage and make it current
    ///
    /// The superseded cache entry is kept until [`Attacher::cleanup`] runs,
    /// so the previously persisted reference stays valid until the promoted
    /// one is persisted.
    #[instrument(skip(self), fields(record = %self.record, name = %self.name))]
    pub async fn promote_now(&mut self) -> AttacheResult<()> {
        let cached = match &self.file {
            Some(data) if !data.is_on(&self.store) => data.clone(),
            _ => return Ok(()),
        };

        let ctx = self.context(Action::Store);
        let stored = match &cached {
            AttachmentData::Single(file) => {
                let io = self.uploader.open(file).await?;
                self.uploader.upload(io, &self.store, &ctx).await?
            }
            AttachmentData::Versions(versions) => self.promote_versions(versions, &ctx).await?,
        };

        info!(from = %cached.ids(), to = %stored.ids(), storage = %self.store, "Attachment promoted");
        self.set(Some(stored));
        self.promoted.push(cached);
        Ok(())
    }

    async fn promote_versions(
        &self,
        versions: &IndexMap<String, UploadedFile>,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        let mut stored = IndexMap::new();
        for (version, file) in versions {
            match self.copy_file(file, &ctx.with_version(version)).await {
                Ok(copy) => {
                    stored.insert(version.clone(), copy);
                }
                Err(e) => {
                    if !stored.is_empty() {
                        self.delete_quietly(&AttachmentData::Versions(stored)).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(AttachmentData::Versions(stored))
    }

    async fn copy_file(&self, file: &UploadedFile, ctx: &Context) -> AttacheResult<UploadedFile> {
        let mut io = self.uploader.open(file).await?;
        let result = self.uploader.upload_file(io.as_mut(), &self.store, ctx).await;
        if let Err(e) = io.close().await {
            warn!(id = %file.id, error = %e, "Failed to close promoted stream");
        }
        result
    }

    /// Delete the stored file the pending change superseded
    ///
    /// Clears change tracking even when deletion fails; the failure is
    /// reported as [`AttacheError::OrphanDeletion`].
    pub async fn replace(&mut self) -> AttacheResult<()> {
        if !self.changed {
            return Ok(());
        }
        let previous = self.previous.take();
        self.changed = false;

        match previous {
            Some(previous) if self.is_detached_stored(&previous) => self.destroy_data(previous).await,
            _ => Ok(()),
        }
    }

    fn is_detached_stored(&self, data: &AttachmentData) -> bool {
        !data.is_on(&self.cache) && self.file.as_ref() != Some(data)
    }

    /// Promote, then delete the replaced file
    ///
    /// Meant to run after the cached reference was persisted; persist the
    /// promoted reference afterwards and call [`Attacher::cleanup`].
    pub async fn finalize(&mut self) -> AttacheResult<()> {
        self.promote().await?;
        self.replace().await
    }

    /// Delete cache entries superseded by promotion
    pub async fn cleanup(&mut self) -> AttacheResult<()> {
        let promoted = std::mem::take(&mut self.promoted);
        let ctx = self.context(Action::Destroy);
        let mut first_error = None;

        for data in promoted {
            if self.file.as_ref() == Some(&data) {
                continue;
            }
            for file in data.files() {
                if let Err(e) = self.uploader.delete(file, &ctx).await {
                    warn!(id = %file.id, storage = %file.storage_name, error = %e, "Failed to delete promoted cache entry");
                    if first_error.is_none() {
                        first_error = Some(orphan(file, e));
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Delete the current file and any pending replaced file
    #[instrument(skip(self), fields(record = %self.record, name = %self.name))]
    pub async fn destroy(&mut self) -> AttacheResult<()> {
        let mut first_error = None;

        if self.changed {
            if let Some(previous) = self.previous.take() {
                if self.is_detached_stored(&previous) {
                    if let Err(e) = self.destroy_data(previous).await {
                        first_error = Some(e);
                    }
                }
            }
            self.changed = false;
        }

        if let Some(data) = self.file.clone() {
            if let Err(e) = self.destroy_data(data).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn destroy_data(&self, data: AttachmentData) -> AttacheResult<()> {
        let ids = data.ids();
        let storage = data
            .main_file()
            .map(|file| file.storage_name.clone())
            .unwrap_or_default();

        match AttacherNext::new(self.uploader.attacher_layers())
            .destroy_attached(self, data)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_orphan() => Err(e),
            Err(e) => Err(AttacheError::OrphanDeletion {
                id: ids,
                storage,
                source: Box::new(e),
            }),
        }
    }

    /// Delete `data` immediately, bypassing background hooks
    pub async fn destroy_now(&self, data: AttachmentData) -> AttacheResult<()> {
        self.base_destroy_attached(data).await
    }

    async fn delete_quietly(&self, data: &AttachmentData) {
        let ctx = self.context(Action::Destroy);
        for file in data.files() {
            if let Err(e) = self.uploader.delete(file, &ctx).await {
                warn!(id = %file.id, storage = %file.storage_name, error = %e, "Failed to discard file");
            }
        }
    }

    /// URL of the current file, or the default URL when nothing is attached
    pub async fn url(&self, options: &Options) -> AttacheResult<Option<String>> {
        match self.file.as_ref().and_then(AttachmentData::main_file) {
            Some(file) => self.uploader.url(file, options).await.map(Some),
            None => Ok(self.default_url(options)),
        }
    }

    /// URL of a named version, or the default URL for that version
    pub async fn version_url(&self, version: &str, options: &Options) -> AttacheResult<Option<String>> {
        match self.file.as_ref().and_then(|data| data.version(version)) {
            Some(file) => self.uploader.url(file, options).await.map(Some),
            None => {
                let mut options = options.clone();
                options.insert("version".to_string(), Value::from(version));
                Ok(self.default_url(&options))
            }
        }
    }

    pub fn default_url(&self, options: &Options) -> Option<String> {
        AttacherNext::new(self.uploader.attacher_layers()).default_url(self, options)
    }

    /// Promote and persist only if the column still holds the value this
    /// attacher was loaded with
    ///
    /// On a lost race the promoted files are deleted, the attacher is left
    /// as it was and [`AttacheError::AttachmentChanged`] is returned.
    #[instrument(skip(self, store), fields(record = %self.record, name = %self.name))]
    pub async fn atomic_promote(&mut self, store: &dyn ColumnStore) -> AttacheResult<()> {
        let current = store.read(&self.record, &self.name).await?;
        if !same_attachment(current.as_deref(), self.column.as_deref()) {
            return Err(AttacheError::AttachmentChanged);
        }
        if !self.needs_promotion() {
            return Ok(());
        }

        let cached = self.file.clone();
        let cached_column = self.column.clone();
        self.promote_now().await?;

        let swapped = store
            .compare_and_swap(&self.record, &self.name, current.as_deref(), self.column.as_deref())
            .await?;
        if !swapped {
            if let Some(stored) = self.file.take() {
                self.delete_quietly(&stored).await;
            }
            self.file = cached;
            self.column = cached_column;
            self.promoted.clear();
            warn!("Attachment changed during promotion, promoted files discarded");
            return Err(AttacheError::AttachmentChanged);
        }

        self.cleanup().await
    }

    /// Serializable description of a deferred promote or destroy
    pub fn to_payload(&self, action: BackgroundAction) -> AttacheResult<BackgroundPayload> {
        let data = self
            .file
            .as_ref()
            .ok_or_else(|| AttacheError::Background("nothing is attached".to_string()))?;
        self.payload_for(action, data)
    }

    pub(crate) fn payload_for(
        &self,
        action: BackgroundAction,
        data: &AttachmentData,
    ) -> AttacheResult<BackgroundPayload> {
        if action == BackgroundAction::Promote && !self.record.is_persisted() {
            return Err(AttacheError::Background(format!(
                "cannot defer promotion for unsaved record {}",
                self.record
            )));
        }
        Ok(BackgroundPayload {
            action,
            uploader: self.uploader.name().to_string(),
            record: self.record.clone(),
            name: self.name.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            data: data.to_value(),
        })
    }

    /// Rebuild the attacher a payload was created from
    pub fn from_payload(uploader: Uploader, payload: &BackgroundPayload) -> AttacheResult<Self> {
        if uploader.name() != payload.uploader {
            return Err(AttacheError::InvalidInput(format!(
                "payload belongs to uploader {}, not {}",
                payload.uploader,
                uploader.name()
            )));
        }
        let data = payload.attachment()?;
        let mut attacher = Self::new(uploader, payload.record.clone(), payload.name.clone())
            .with_storages(payload.cache.clone(), payload.store.clone());
        attacher.set(Some(data));
        Ok(attacher)
    }

    // Base hook behavior

    pub(crate) async fn base_assign_cached(&self, data: AttachmentData) -> AttacheResult<AttachmentData> {
        if self.uploader.attacher_settings().verify_cached_existence {
            for file in data.files() {
                if !self.uploader.exists(file).await? {
                    return Err(AttacheError::InvalidInput(format!(
                        "cached file {} does not exist",
                        file.id
                    )));
                }
            }
        }
        Ok(data)
    }

    pub(crate) async fn base_destroy_attached(&self, data: AttachmentData) -> AttacheResult<()> {
        let ctx = self.context(Action::Destroy);
        let mut first_error = None;
        for file in data.files() {
            if let Err(e) = self.uploader.delete(file, &ctx).await {
                warn!(id = %file.id, storage = %file.storage_name, error = %e, "Failed to delete detached file");
                if first_error.is_none() {
                    first_error = Some(orphan(file, e));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn orphan(file: &UploadedFile, source: AttacheError) -> AttacheError {
    AttacheError::OrphanDeletion {
        id: file.id.clone(),
        storage: file.storage_name.clone(),
        source: Box::new(source),
    }
}

/// Compare column values by the files they reference
fn same_attachment(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match (AttachmentData::from_json(a), AttachmentData::from_json(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        },
        _ => false,
    }
}

impl std::fmt::Debug for Attacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attacher")
            .field("uploader", &self.uploader.name())
            .field("record", &self.record)
            .field("name", &self.name)
            .field("file", &self.file)
            .field("changed", &self.changed)
            .finish()
    }
}
