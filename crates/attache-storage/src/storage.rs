//! Storage Abstraction
//!
//! Provides a unified interface for file storage backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use attache_core::Options;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::io::{read_to_end, BoxIo, BytesIo, FileIo, UploadIo, CHUNK_SIZE};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Storage not registered: {0}")]
    NotRegistered(String),
    #[error("Operation not supported by {0} storage")]
    Unsupported(String),
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Parameters for a direct-to-storage client upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedRequest {
    pub method: String,
    pub url: String,
    /// Form fields for POST uploads
    #[serde(default)]
    pub fields: IndexMap<String, String>,
    /// Headers for PUT uploads
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

/// Storage trait - unified interface for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write the content of `io` under `id`
    async fn put(&self, id: &str, io: &mut dyn UploadIo, options: &Options) -> StorageResult<()>;

    /// Open a stored file for reading
    async fn open(&self, id: &str) -> StorageResult<BoxIo>;

    /// Check if a file exists
    async fn exists(&self, id: &str) -> StorageResult<bool>;

    /// Delete a file; deleting a missing file is not an error
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// URL the file can be downloaded from
    async fn url(&self, id: &str, options: &Options) -> StorageResult<String>;

    /// Parameters for uploading directly to the storage (if supported)
    async fn presign(&self, _id: &str, _options: &Options) -> StorageResult<PresignedRequest> {
        Err(StorageError::Unsupported(self.name().to_string()))
    }

    /// Get storage name for logging
    fn name(&self) -> &str;
}

fn host_prefix(options: &Options) -> &str {
    options
        .get("host")
        .and_then(|host| host.as_str())
        .map(|host| host.trim_end_matches('/'))
        .unwrap_or("")
}

/// Local filesystem storage
pub struct LocalStorage {
    /// Root directory for storage
    root: PathBuf,
    /// Subdirectory files are written under, also part of the URL
    prefix: Option<String>,
    /// Base URL for generating URLs
    base_url: String,
}

impl LocalStorage {
    /// Create a new local storage
    pub fn new(root: impl AsRef<Path>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            prefix: None,
            base_url: base_url.into(),
        }
    }

    /// Store files under a subdirectory of the root
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = Some(prefix.trim_matches('/').to_string());
        self
    }

    /// Create storage with a temp directory
    pub fn temp() -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join("attache-storage");
        std::fs::create_dir_all(&dir)?;
        Ok(Self::new(dir, "/uploads"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an id to a full path
    fn resolve_path(&self, id: &str) -> StorageResult<PathBuf> {
        // Prevent directory traversal
        if id.is_empty()
            || id.split(|c: char| c == '/' || c == '\\').any(|segment| segment == "..")
            || id.starts_with('/')
            || id.starts_with('\\')
        {
            return Err(StorageError::InvalidPath(id.to_string()));
        }

        let base = match &self.prefix {
            Some(prefix) => self.root.join(prefix),
            None => self.root.clone(),
        };
        Ok(base.join(id))
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    #[instrument(skip(self, io, _options), fields(storage = "local"))]
    async fn put(&self, id: &str, io: &mut dyn UploadIo, _options: &Options) -> StorageResult<()> {
        let path = self.resolve_path(id)?;
        self.ensure_parent(&path).await?;

        let mut file = fs::File::create(&path).await?;
        let mut size = 0u64;
        while let Some(chunk) = io.read_chunk(CHUNK_SIZE).await? {
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        debug!(path = ?path, size = size, "File stored");
        Ok(())
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn open(&self, id: &str) -> StorageResult<BoxIo> {
        let path = self.resolve_path(id)?;

        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(FileIo::open_anonymous(&path).await?.boxed())
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let path = self.resolve_path(id)?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.resolve_path(id)?;

        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
            debug!(path = ?path, "File deleted");
        }

        Ok(())
    }

    async fn url(&self, id: &str, options: &Options) -> StorageResult<String> {
        self.resolve_path(id)?;
        let base = self.base_url.trim_end_matches('/');
        Ok(match &self.prefix {
            Some(prefix) => format!("{}{}/{}/{}", host_prefix(options), base, prefix, id),
            None => format!("{}{}/{}", host_prefix(options), base, id),
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// In-memory storage for testing
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Bytes>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Raw content of a stored file
    pub async fn read(&self, id: &str) -> Option<Bytes> {
        self.files.read().await.get(id).cloned()
    }

    /// Ids of every stored file, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.files.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, id: &str, io: &mut dyn UploadIo, _options: &Options) -> StorageResult<()> {
        let data = read_to_end(io).await?;

        let mut files = self.files.write().await;
        files.insert(id.to_string(), data);

        Ok(())
    }

    async fn open(&self, id: &str) -> StorageResult<BoxIo> {
        let files = self.files.read().await;
        files
            .get(id)
            .map(|data| BytesIo::new(data.clone()).boxed())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let files = self.files.read().await;
        Ok(files.contains_key(id))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut files = self.files.write().await;
        files.remove(id);
        Ok(())
    }

    async fn url(&self, id: &str, options: &Options) -> StorageResult<String> {
        Ok(match host_prefix(options) {
            "" => format!("memory://{}", id),
            host => format!("{}/{}", host, id),
        })
    }

    async fn presign(&self, id: &str, _options: &Options) -> StorageResult<PresignedRequest> {
        Ok(PresignedRequest {
            method: "PUT".to_string(),
            url: format!("memory://{}", id),
            fields: IndexMap::new(),
            headers: IndexMap::new(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
