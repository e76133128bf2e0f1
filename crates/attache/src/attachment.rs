//! Attachment column data
//!
//! What an attachment attribute persists: either one uploaded file or a
//! named set of versions produced by processing.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttacheError, AttacheResult};
use crate::uploaded_file::UploadedFile;

/// Version name preferred as the main file of a versioned attachment
pub const ORIGINAL_VERSION: &str = "original";

/// Persisted attachment value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentData {
    Single(UploadedFile),
    Versions(IndexMap<String, UploadedFile>),
}

impl AttachmentData {
    /// All referenced files, in version order
    pub fn files(&self) -> Vec<&UploadedFile> {
        match self {
            AttachmentData::Single(file) => vec![file],
            AttachmentData::Versions(versions) => versions.values().collect(),
        }
    }

    /// The file URLs and validations refer to by default
    pub fn main_file(&self) -> Option<&UploadedFile> {
        match self {
            AttachmentData::Single(file) => Some(file),
            AttachmentData::Versions(versions) => versions
                .get(ORIGINAL_VERSION)
                .or_else(|| versions.values().next()),
        }
    }

    pub fn version(&self, name: &str) -> Option<&UploadedFile> {
        match self {
            AttachmentData::Single(_) => None,
            AttachmentData::Versions(versions) => versions.get(name),
        }
    }

    pub fn is_versions(&self) -> bool {
        matches!(self, AttachmentData::Versions(_))
    }

    /// Whether every referenced file lives on `storage`
    pub fn is_on(&self, storage: &str) -> bool {
        self.files().iter().all(|file| file.is_on(storage))
    }

    /// Comma separated ids, for log lines and errors
    pub fn ids(&self) -> String {
        self.files()
            .iter()
            .map(|file| file.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn to_value(&self) -> Value {
        match self {
            AttachmentData::Single(file) => file.to_value(),
            AttachmentData::Versions(versions) => Value::Object(
                versions
                    .iter()
                    .map(|(name, file)| (name.clone(), file.to_value()))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse and structurally validate a serialized attachment
    pub fn from_value(value: Value) -> AttacheResult<Self> {
        let data: AttachmentData = serde_json::from_value(value)
            .map_err(|e| AttacheError::InvalidInput(format!("invalid attachment data: {}", e)))?;
        data.check()?;
        Ok(data)
    }

    /// Structural validity: non-empty ids and storage names, at least one version
    pub(crate) fn check(&self) -> AttacheResult<()> {
        match self {
            AttachmentData::Single(file) => file.check(),
            AttachmentData::Versions(versions) => {
                if versions.is_empty() {
                    return Err(AttacheError::InvalidInput(
                        "attachment has no versions".to_string(),
                    ));
                }
                versions.values().try_for_each(UploadedFile::check)
            }
        }
    }

    pub fn from_json(json: &str) -> AttacheResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AttacheError::InvalidInput(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }
}

impl From<UploadedFile> for AttachmentData {
    fn from(file: UploadedFile) -> Self {
        AttachmentData::Single(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_core::Metadata;
    use serde_json::json;

    fn file(id: &str, storage: &str) -> UploadedFile {
        UploadedFile::new(id, storage, Metadata::new())
    }

    #[test]
    fn test_single_parse() {
        let data = AttachmentData::from_json(r#"{"id":"a.jpg","storage":"cache","metadata":{"size":3}}"#)
            .unwrap();
        assert_eq!(data, AttachmentData::Single(file("a.jpg", "cache")));
        assert!(data.is_on("cache"));
        assert_eq!(data.main_file().unwrap().size(), Some(3));
    }

    #[test]
    fn test_versions_parse_and_order() {
        let value = json!({
            "thumb": {"id": "t.jpg", "storage": "store", "metadata": {}},
            "original": {"id": "o.jpg", "storage": "store", "metadata": {}},
        });
        let data = AttachmentData::from_value(value).unwrap();

        assert!(data.is_versions());
        assert_eq!(data.ids(), "t.jpg,o.jpg");
        assert_eq!(data.main_file().unwrap().id, "o.jpg");
        assert_eq!(data.version("thumb").unwrap().id, "t.jpg");
        assert!(data.is_on("store"));

        let reparsed = AttachmentData::from_json(&data.to_json()).unwrap();
        assert_eq!(reparsed, data);
    }

    #[test]
    fn test_mixed_storages() {
        let mut versions = IndexMap::new();
        versions.insert("a".to_string(), file("a", "cache"));
        versions.insert("b".to_string(), file("b", "store"));
        let data = AttachmentData::Versions(versions);
        assert!(!data.is_on("cache"));
        assert!(!data.is_on("store"));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(AttachmentData::from_json("{}").is_err());
        assert!(AttachmentData::from_json("[1,2]").is_err());
        assert!(AttachmentData::from_json(r#"{"id": 5, "storage": "cache"}"#).is_err());
        assert!(AttachmentData::from_json(r#"{"thumb": {"id": "t"}}"#).is_err());
    }
}
