//! Override layers and their `next` chains
//!
//! Every hook is resolved from the most recently loaded plugin downwards.
//! A layer receives a `next` handle pointing at the layers loaded before it;
//! calling the same hook on `next` delegates, and an empty chain falls
//! through to the base behavior. Hooks that need other hooks call them on
//! the uploader (or attacher), which re-enters from the top of the stack.

use std::sync::Arc;

use async_trait::async_trait;
use attache_core::{Context, Metadata, Options, ValidationErrors};
use attache_storage::{BoxIo, UploadIo};
use indexmap::IndexMap;

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::error::AttacheResult;
use crate::uploaded_file::UploadedFile;
use crate::uploader::Uploader;

/// Loaded layers, paired with the name of the plugin that contributed them
pub(crate) type LayerStack<L> = Vec<(String, Arc<L>)>;

/// Result of processing an upload
pub enum Processed {
    /// Upload this stream instead of the original
    Single(BoxIo),
    /// Upload every stream as a named version
    Versions(IndexMap<String, BoxIo>),
}

impl Processed {
    /// Close every stream, reporting the first failure
    pub async fn close(&mut self) -> std::io::Result<()> {
        match self {
            Processed::Single(io) => io.close().await,
            Processed::Versions(versions) => {
                let mut result = Ok(());
                for io in versions.values_mut() {
                    if let Err(e) = io.close().await {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                result
            }
        }
    }
}

impl std::fmt::Debug for Processed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Processed::Single(_) => f.write_str("Processed::Single"),
            Processed::Versions(versions) => f
                .debug_tuple("Processed::Versions")
                .field(&versions.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// Uploader overrides
#[async_trait]
pub trait UploaderLayer: Send + Sync {
    /// Full upload pipeline
    async fn upload(
        &self,
        io: BoxIo,
        storage: &str,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        next.upload(io, storage, ctx).await
    }

    /// Transform the input before it is stored; `None` keeps it unchanged
    async fn process(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Option<Processed>> {
        next.process(io, ctx).await
    }

    /// Store the result of processing
    async fn store_processed(
        &self,
        processed: Processed,
        storage: &str,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        next.store_processed(processed, storage, ctx).await
    }

    async fn extract_metadata(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Metadata> {
        next.extract_metadata(io, ctx).await
    }

    fn generate_location(&self, metadata: &Metadata, ctx: &Context, next: UploaderNext<'_>) -> String {
        next.generate_location(metadata, ctx)
    }

    async fn delete(
        &self,
        file: &UploadedFile,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<()> {
        next.delete(file, ctx).await
    }
}

/// Remaining uploader layers below the current one
#[derive(Clone, Copy)]
pub struct UploaderNext<'a> {
    uploader: &'a Uploader,
    rest: &'a [(String, Arc<dyn UploaderLayer>)],
}

impl<'a> UploaderNext<'a> {
    pub(crate) fn new(uploader: &'a Uploader, rest: &'a [(String, Arc<dyn UploaderLayer>)]) -> Self {
        Self { uploader, rest }
    }

    /// Uploader class the chain belongs to
    pub fn uploader(&self) -> &'a Uploader {
        self.uploader
    }

    fn pop(self) -> Option<(&'a dyn UploaderLayer, UploaderNext<'a>)> {
        let ((_, layer), rest) = self.rest.split_last()?;
        Some((
            layer.as_ref(),
            UploaderNext {
                uploader: self.uploader,
                rest,
            },
        ))
    }

    pub async fn upload(self, io: BoxIo, storage: &str, ctx: &Context) -> AttacheResult<AttachmentData> {
        match self.pop() {
            Some((layer, next)) => layer.upload(io, storage, ctx, next).await,
            None => self.uploader.base_upload(io, storage, ctx).await,
        }
    }

    pub async fn process(
        self,
        io: &mut dyn UploadIo,
        ctx: &Context,
    ) -> AttacheResult<Option<Processed>> {
        match self.pop() {
            Some((layer, next)) => layer.process(io, ctx, next).await,
            None => Ok(None),
        }
    }

    pub async fn store_processed(
        self,
        processed: Processed,
        storage: &str,
        ctx: &Context,
    ) -> AttacheResult<AttachmentData> {
        match self.pop() {
            Some((layer, next)) => layer.store_processed(processed, storage, ctx, next).await,
            None => self.uploader.base_store_processed(processed, storage, ctx).await,
        }
    }

    pub async fn extract_metadata(self, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Metadata> {
        match self.pop() {
            Some((layer, next)) => layer.extract_metadata(io, ctx, next).await,
            None => self.uploader.base_extract_metadata(io).await,
        }
    }

    pub fn generate_location(self, metadata: &Metadata, ctx: &Context) -> String {
        match self.pop() {
            Some((layer, next)) => layer.generate_location(metadata, ctx, next),
            None => crate::uploader::random_location(metadata, ctx),
        }
    }

    pub async fn delete(self, file: &UploadedFile, ctx: &Context) -> AttacheResult<()> {
        match self.pop() {
            Some((layer, next)) => layer.delete(file, ctx, next).await,
            None => self.uploader.base_delete(file).await,
        }
    }
}

/// Attacher overrides
#[async_trait]
pub trait AttacherLayer: Send + Sync {
    /// Collect validation errors for a file about to be assigned
    fn validate(&self, attacher: &Attacher, data: &AttachmentData, next: AttacherNext<'_>) -> ValidationErrors {
        next.validate(attacher, data)
    }

    /// Vet a client-supplied cached reference before it is assigned
    async fn assign_cached(
        &self,
        attacher: &Attacher,
        data: AttachmentData,
        next: AttacherNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        next.assign_cached(attacher, data).await
    }

    /// Move the cached file to permanent storage
    async fn promote(&self, attacher: &mut Attacher, next: AttacherNext<'_>) -> AttacheResult<()> {
        next.promote(attacher).await
    }

    /// Delete files that are no longer attached
    async fn destroy_attached(
        &self,
        attacher: &Attacher,
        data: AttachmentData,
        next: AttacherNext<'_>,
    ) -> AttacheResult<()> {
        next.destroy_attached(attacher, data).await
    }

    /// URL returned when nothing is attached
    fn default_url(&self, attacher: &Attacher, options: &Options, next: AttacherNext<'_>) -> Option<String> {
        next.default_url(attacher, options)
    }
}

/// Remaining attacher layers below the current one
#[derive(Clone, Copy)]
pub struct AttacherNext<'a> {
    rest: &'a [(String, Arc<dyn AttacherLayer>)],
}

impl<'a> AttacherNext<'a> {
    pub(crate) fn new(rest: &'a [(String, Arc<dyn AttacherLayer>)]) -> Self {
        Self { rest }
    }

    fn pop(self) -> Option<(&'a dyn AttacherLayer, AttacherNext<'a>)> {
        let ((_, layer), rest) = self.rest.split_last()?;
        Some((layer.as_ref(), AttacherNext { rest }))
    }

    pub fn validate(self, attacher: &Attacher, data: &AttachmentData) -> ValidationErrors {
        match self.pop() {
            Some((layer, next)) => layer.validate(attacher, data, next),
            None => ValidationErrors::new(),
        }
    }

    pub async fn assign_cached(
        self,
        attacher: &Attacher,
        data: AttachmentData,
    ) -> AttacheResult<AttachmentData> {
        match self.pop() {
            Some((layer, next)) => layer.assign_cached(attacher, data, next).await,
            None => attacher.base_assign_cached(data).await,
        }
    }

    pub async fn promote(self, attacher: &mut Attacher) -> AttacheResult<()> {
        match self.pop() {
            Some((layer, next)) => layer.promote(attacher, next).await,
            None => attacher.promote_now().await,
        }
    }

    pub async fn destroy_attached(self, attacher: &Attacher, data: AttachmentData) -> AttacheResult<()> {
        match self.pop() {
            Some((layer, next)) => layer.destroy_attached(attacher, data, next).await,
            None => attacher.base_destroy_attached(data).await,
        }
    }

    pub fn default_url(self, attacher: &Attacher, options: &Options) -> Option<String> {
        match self.pop() {
            Some((layer, next)) => layer.default_url(attacher, options, next),
            None => None,
        }
    }
}

/// Uploaded file overrides
#[async_trait]
pub trait FileLayer: Send + Sync {
    async fn url(&self, file: &UploadedFile, options: &Options, next: FileNext<'_>) -> AttacheResult<String> {
        next.url(file, options).await
    }
}

/// Remaining file layers below the current one
#[derive(Clone, Copy)]
pub struct FileNext<'a> {
    uploader: &'a Uploader,
    rest: &'a [(String, Arc<dyn FileLayer>)],
}

impl<'a> FileNext<'a> {
    pub(crate) fn new(uploader: &'a Uploader, rest: &'a [(String, Arc<dyn FileLayer>)]) -> Self {
        Self { uploader, rest }
    }

    pub fn uploader(&self) -> &'a Uploader {
        self.uploader
    }

    pub async fn url(self, file: &UploadedFile, options: &Options) -> AttacheResult<String> {
        match self.rest.split_last() {
            Some(((_, layer), rest)) => {
                let next = FileNext {
                    uploader: self.uploader,
                    rest,
                };
                layer.url(file, options, next).await
            }
            None => self.uploader.base_url(file, options).await,
        }
    }
}
