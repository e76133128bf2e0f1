//! Shared value types

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered metadata map attached to every uploaded file.
pub type Metadata = IndexMap<String, serde_json::Value>;

/// Free-form options passed to storages, URL generation and plugins.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Metadata keys every uploaded file carries.
pub mod metadata_keys {
    pub const FILENAME: &str = "filename";
    pub const MIME_TYPE: &str = "mime_type";
    pub const SIZE: &str = "size";
}

/// Why an upload or delete is happening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Cache,
    Store,
    Recache,
    Backup,
    Destroy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Store => "store",
            Self::Recache => "recache",
            Self::Backup => "backup",
            Self::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque identity of the record owning an attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// Record type, e.g. "Photo"
    pub record_type: String,
    /// Primary key, absent for records that were never persisted
    pub id: Option<String>,
}

impl RecordRef {
    pub fn new(record_type: impl Into<String>, id: impl ToString) -> Self {
        Self {
            record_type: record_type.into(),
            id: Some(id.to_string()),
        }
    }

    /// A record that has not been persisted yet
    pub fn unsaved(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}#{}", self.record_type, id),
            None => write!(f, "{}#new", self.record_type),
        }
    }
}

/// Context passed to every upload, processing, location and delete hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Owning record
    pub record: Option<RecordRef>,
    /// Attachment attribute name
    pub name: Option<String>,
    /// Why the operation is happening
    pub action: Action,
    /// Version being uploaded, when processing produced several
    pub version: Option<String>,
    /// Explicit location, bypassing location generation
    pub location: Option<String>,
    /// Plugin-added keys
    #[serde(default)]
    pub extra: Options,
}

impl Context {
    pub fn new(action: Action) -> Self {
        Self {
            record: None,
            name: None,
            action,
            version: None,
            location: None,
            extra: Options::new(),
        }
    }

    /// Set the owning record
    pub fn record(mut self, record: RecordRef) -> Self {
        self.record = Some(record);
        self
    }

    /// Set the attribute name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use an explicit location instead of a generated one
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_version(&self, version: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.version = Some(version.into());
        ctx
    }

    pub fn with_action(&self, action: Action) -> Self {
        let mut ctx = self.clone();
        ctx.action = action;
        ctx
    }

    /// Add a plugin-specific key
    pub fn insert(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_string(&Action::Recache).unwrap();
        assert_eq!(json, "\"recache\"");

        let action: Action = serde_json::from_str("\"destroy\"").unwrap();
        assert_eq!(action, Action::Destroy);
    }

    #[test]
    fn test_context_builder() {
        let ctx = Context::new(Action::Cache)
            .record(RecordRef::new("Photo", 7))
            .name("image")
            .insert("tenant", serde_json::json!("acme"));

        assert_eq!(ctx.name.as_deref(), Some("image"));
        assert_eq!(ctx.record.as_ref().unwrap().to_string(), "Photo#7");
        assert_eq!(ctx.get("tenant"), Some(&serde_json::json!("acme")));

        let stored = ctx.with_action(Action::Store).with_version("thumb");
        assert_eq!(stored.action, Action::Store);
        assert_eq!(stored.version.as_deref(), Some("thumb"));
        assert_eq!(ctx.action, Action::Cache);
    }

    #[test]
    fn test_unsaved_record() {
        let record = RecordRef::unsaved("Photo");
        assert!(!record.is_persisted());
        assert_eq!(record.to_string(), "Photo#new");
    }
}
