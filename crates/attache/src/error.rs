//! Attache errors

use attache_core::ValidationErrors;
use attache_storage::StorageError;
use thiserror::Error;

/// Storage call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Put,
    Open,
    Exists,
    Delete,
    Url,
    Presign,
}

impl std::fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Put => "put",
            Self::Open => "open",
            Self::Exists => "exists",
            Self::Delete => "delete",
            Self::Url => "url",
            Self::Presign => "presign",
        };
        f.write_str(name)
    }
}

/// Attache errors
#[derive(Debug, Error)]
pub enum AttacheError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid IO: {0}")]
    InvalidIo(String),
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationErrors),
    #[error("Storage error during {operation} on {storage}: {source}")]
    Storage {
        operation: StorageOperation,
        storage: String,
        #[source]
        source: StorageError,
    },
    #[error("Unknown storage: {0}")]
    UnknownStorage(String),
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),
    #[error("Failed to load plugin {plugin}: {message}")]
    PluginLoad { plugin: String, message: String },
    #[error("Failed to delete superseded file {id} on {storage}: {source}")]
    OrphanDeletion {
        id: String,
        storage: String,
        #[source]
        source: Box<AttacheError>,
    },
    #[error("Corrupt attachment data: {0}")]
    CorruptColumn(String),
    #[error("Attachment changed while it was being promoted")]
    AttachmentChanged,
    #[error("Background hook failed: {0}")]
    Background(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type AttacheResult<T> = Result<T, AttacheError>;

impl AttacheError {
    /// Wrap a backend failure with the operation and storage name
    pub fn storage(operation: StorageOperation, storage: &str, source: StorageError) -> Self {
        match source {
            StorageError::NotRegistered(name) => AttacheError::UnknownStorage(name),
            source => AttacheError::Storage {
                operation,
                storage: storage.to_string(),
                source,
            },
        }
    }

    pub fn plugin_load(plugin: &str, message: impl Into<String>) -> Self {
        AttacheError::PluginLoad {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    /// Malformed IO or malformed serialized reference
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, AttacheError::InvalidInput(_) | AttacheError::InvalidIo(_))
    }

    /// Composition-time error that should abort startup
    pub fn is_composition_error(&self) -> bool {
        matches!(
            self,
            AttacheError::PluginNotFound(_) | AttacheError::PluginLoad { .. }
        )
    }

    /// Cleanup failure that does not invalidate the current attachment state
    pub fn is_orphan(&self) -> bool {
        matches!(self, AttacheError::OrphanDeletion { .. })
    }

    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            AttacheError::ValidationFailed(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AttacheError {
    fn from(err: std::io::Error) -> Self {
        AttacheError::InvalidIo(err.to_string())
    }
}
