//! Uploaded file references
//!
//! An [`UploadedFile`] is the serializable pointer to bytes living on a
//! named storage. Two references are equal when they point at the same
//! location on the same storage, regardless of metadata.

use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;

use async_trait::async_trait;
use attache_core::{metadata_keys, Metadata};
use attache_storage::{BoxIo, UploadIo};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttacheError, AttacheResult};

/// Reference to a file stored on a named storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Location on the storage
    pub id: String,
    /// Registered storage name
    #[serde(rename = "storage")]
    pub storage_name: String,
    /// Extracted metadata (filename, mime_type, size and plugin keys)
    #[serde(default)]
    pub metadata: Metadata,
}

impl UploadedFile {
    pub fn new(id: impl Into<String>, storage_name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            storage_name: storage_name.into(),
            metadata,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::FILENAME)
            .and_then(Value::as_str)
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::MIME_TYPE)
            .and_then(Value::as_str)
    }

    pub fn size(&self) -> Option<u64> {
        self.metadata.get(metadata_keys::SIZE).and_then(Value::as_u64)
    }

    /// Lowercased extension of the id, falling back to the original filename
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.id).or_else(|| self.filename().and_then(extension_of))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn is_on(&self, storage: &str) -> bool {
        self.storage_name == storage
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "storage": self.storage_name,
            "metadata": self.metadata,
        })
    }

    /// Parse and structurally validate a serialized reference
    pub fn from_value(value: Value) -> AttacheResult<Self> {
        let file: UploadedFile = serde_json::from_value(value)
            .map_err(|e| AttacheError::InvalidInput(format!("invalid file reference: {}", e)))?;
        file.check()?;
        Ok(file)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn from_json(json: &str) -> AttacheResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AttacheError::InvalidInput(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub(crate) fn check(&self) -> AttacheResult<()> {
        if self.id.is_empty() {
            return Err(AttacheError::InvalidInput("file id is empty".to_string()));
        }
        if self.storage_name.is_empty() {
            return Err(AttacheError::InvalidInput(
                "file storage is empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

impl PartialEq for UploadedFile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.storage_name == other.storage_name
    }
}

impl Eq for UploadedFile {}

impl Hash for UploadedFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.storage_name.hash(state);
    }
}

/// Stream over a stored file that reports the file's metadata
///
/// Promotion re-uploads through this wrapper so the target upload keeps the
/// filename, type and size extracted when the file was cached.
pub struct UploadedFileIo {
    inner: BoxIo,
    file: UploadedFile,
    expose_metadata: bool,
}

impl UploadedFileIo {
    pub fn new(inner: BoxIo, file: UploadedFile) -> Self {
        Self {
            inner,
            file,
            expose_metadata: true,
        }
    }

    /// Wrapper that keeps the client-provided filename and type but forces
    /// metadata to be extracted from the actual content
    pub fn for_refresh(inner: BoxIo, file: UploadedFile) -> Self {
        Self {
            inner,
            file,
            expose_metadata: false,
        }
    }

    pub fn file(&self) -> &UploadedFile {
        &self.file
    }
}

#[async_trait]
impl UploadIo for UploadedFileIo {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        self.inner.read_chunk(max).await
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.inner.rewind().await
    }

    fn is_eof(&self) -> bool {
        self.inner.is_eof()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn original_filename(&self) -> Option<&str> {
        self.file.filename()
    }

    fn content_type(&self) -> Option<&str> {
        self.file.mime_type()
    }

    fn size(&self) -> Option<u64> {
        if self.expose_metadata {
            self.file.size().or_else(|| self.inner.size())
        } else {
            self.inner.size()
        }
    }

    fn stored_metadata(&self) -> Option<&Metadata> {
        self.expose_metadata.then_some(&self.file.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_storage::{read_to_end, BytesIo};
    use serde_json::json;

    fn sample() -> UploadedFile {
        let mut metadata = Metadata::new();
        metadata.insert("filename".to_string(), json!("Report.PDF"));
        metadata.insert("mime_type".to_string(), json!("application/pdf"));
        metadata.insert("size".to_string(), json!(42));
        UploadedFile::new("abc123.pdf", "store", metadata)
    }

    #[test]
    fn test_accessors() {
        let file = sample();
        assert_eq!(file.filename(), Some("Report.PDF"));
        assert_eq!(file.mime_type(), Some("application/pdf"));
        assert_eq!(file.size(), Some(42));
        assert_eq!(file.extension().as_deref(), Some("pdf"));
        assert!(file.is_on("store"));
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let a = sample();
        let mut b = sample();
        b.metadata.insert("size".to_string(), json!(1));
        assert_eq!(a, b);

        let c = UploadedFile::new("abc123.pdf", "cache", Metadata::new());
        assert_ne!(a, c);
    }

    #[test]
    fn test_json_roundtrip_preserves_metadata() {
        let file = sample();
        let json = file.to_json();
        assert!(json.contains("\"storage\":\"store\""));

        let parsed = UploadedFile::from_json(&json).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(parsed.metadata, file.metadata);
    }

    #[test]
    fn test_metadata_order_survives_json() {
        let mut metadata = Metadata::new();
        metadata.insert("size".to_string(), json!(42));
        metadata.insert("filename".to_string(), json!("report.pdf"));
        metadata.insert("mime_type".to_string(), json!("application/pdf"));
        let file = UploadedFile::new("abc123.pdf", "store", metadata);

        let parsed = UploadedFile::from_json(&file.to_json()).unwrap();
        let keys: Vec<&str> = parsed.metadata.keys().map(String::as_str).collect();
        assert_eq!(keys, ["size", "filename", "mime_type"]);
    }

    #[test]
    fn test_invalid_references() {
        assert!(matches!(
            UploadedFile::from_json("not json"),
            Err(AttacheError::InvalidInput(_))
        ));
        assert!(matches!(
            UploadedFile::from_value(json!({"id": "a"})),
            Err(AttacheError::InvalidInput(_))
        ));
        assert!(matches!(
            UploadedFile::from_value(json!({"id": "", "storage": "cache"})),
            Err(AttacheError::InvalidInput(_))
        ));
        assert!(matches!(
            UploadedFile::from_value(json!({"id": "a", "storage": "cache", "metadata": 5})),
            Err(AttacheError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_uploaded_file_io_reports_metadata() {
        let inner = BytesIo::new("0123456789").boxed();
        let mut io = UploadedFileIo::new(inner, sample());

        assert_eq!(io.original_filename(), Some("Report.PDF"));
        assert_eq!(io.size(), Some(42));
        assert!(io.stored_metadata().is_some());
        assert_eq!(read_to_end(&mut io).await.unwrap().len(), 10);

        let inner = BytesIo::new("0123456789").boxed();
        let refresh = UploadedFileIo::for_refresh(inner, sample());
        assert_eq!(refresh.original_filename(), Some("Report.PDF"));
        assert_eq!(refresh.size(), Some(10));
        assert!(refresh.stored_metadata().is_none());
    }
}
