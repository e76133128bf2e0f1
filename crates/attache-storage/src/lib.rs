//! # attache-storage
//!
//! Storage capability and upload IO for Attache.
//!
//! ## Features
//!
//! - `Storage` trait every backend implements (put, open, exists, delete, url, presign)
//! - `UploadIo` trait with in-memory and filesystem adapters
//! - Named storage registry
//! - Local filesystem and in-memory backends

pub mod io;
pub mod registry;
pub mod storage;

pub use io::{read_to_end, BoxIo, BytesIo, FileIo, UploadIo, CHUNK_SIZE};
pub use registry::StorageRegistry;
pub use storage::{
    LocalStorage, MemoryStorage, PresignedRequest, Storage, StorageError, StorageResult,
};
