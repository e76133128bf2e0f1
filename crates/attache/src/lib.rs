//! # attache
//!
//! File attachments for records: assigned files are uploaded to a temporary
//! cache storage, validated, promoted to permanent storage once the record
//! is saved, and deleted when replaced or when the record is destroyed.
//!
//! ## Features
//!
//! - Named uploader classes with isolated plugin stacks
//! - Attacher state machine (assign, promote, replace, destroy)
//! - Plugins: processing, versions, validation, backgrounding,
//!   instrumentation, MIME type detection, signatures, pretty locations,
//!   default URLs, per-storage URL options, cached metadata restoration
//! - Record persistence lifecycle over a pluggable column store

pub mod attacher;
pub mod attachment;
pub mod error;
pub mod model;
pub mod plugin;
pub mod plugins;
pub mod uploaded_file;
pub mod uploader;

#[cfg(test)]
pub(crate) mod testing;

pub use attacher::{AssignInput, Attacher};
pub use attachment::AttachmentData;
pub use error::{AttacheError, AttacheResult, StorageOperation};
pub use model::{Attachable, ColumnStore, MemoryColumnStore};
pub use plugin::{Dependency, Plugin, PluginLayers, PluginRegistry, Processed, Target};
pub use plugins::backgrounding::{BackgroundAction, BackgroundHook, BackgroundPayload};
pub use plugins::processing::Processor;
pub use uploaded_file::{UploadedFile, UploadedFileIo};
pub use uploader::{AttacherSettings, Uploader};

pub use attache_core::{Action, Context, Metadata, Options, RecordRef, ValidationErrors};
pub use attache_storage::{BoxIo, BytesIo, FileIo, Storage, StorageRegistry, UploadIo};
