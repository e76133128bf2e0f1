//! Validation plugin
//!
//! Size, type and extension checks run against every newly assigned file.
//!
//! Options:
//! - `max_size` / `min_size`: byte limits
//! - `allowed_mime_types`: empty or absent allows everything not blocked;
//!   `image/*` style wildcards are supported
//! - `blocked_mime_types`: always rejected, checked first
//! - `allowed_extensions`: case-insensitive extension whitelist

use attache_core::{Options, ValidationErrors};
use serde_json::json;

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::plugin::{
    string_list_option, u64_option, AttacherLayer, AttacherNext, Plugin, PluginLayers, Target,
};
use crate::uploaded_file::UploadedFile;

/// File checks applied on assignment
#[derive(Debug, Clone, Default)]
pub struct FileRules {
    pub max_size: Option<u64>,
    pub min_size: Option<u64>,
    pub allowed_mime_types: Vec<String>,
    pub blocked_mime_types: Vec<String>,
    pub allowed_extensions: Vec<String>,
}

fn mime_matches(pattern: &str, mime_type: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => mime_type
            .split_once('/')
            .map_or(false, |(kind, _)| kind.eq_ignore_ascii_case(prefix)),
        None => pattern.eq_ignore_ascii_case(mime_type),
    }
}

impl FileRules {
    pub fn from_options(options: &Options) -> Result<Self, String> {
        Ok(Self {
            max_size: u64_option(options, "max_size")?,
            min_size: u64_option(options, "min_size")?,
            allowed_mime_types: string_list_option(options, "allowed_mime_types")?.unwrap_or_default(),
            blocked_mime_types: string_list_option(options, "blocked_mime_types")?.unwrap_or_default(),
            allowed_extensions: string_list_option(options, "allowed_extensions")?
                .unwrap_or_default()
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        })
    }

    /// Check if a content type is allowed
    pub fn is_allowed(&self, mime_type: &str) -> bool {
        if self.blocked_mime_types.iter().any(|t| mime_matches(t, mime_type)) {
            return false;
        }
        if self.allowed_mime_types.is_empty() {
            return true;
        }
        self.allowed_mime_types.iter().any(|t| mime_matches(t, mime_type))
    }

    pub fn check(&self, file: &UploadedFile) -> ValidationErrors {
        let mut errors = ValidationErrors::new();

        if let Some(size) = file.size() {
            if let Some(max) = self.max_size {
                if size > max {
                    errors.add("size", format!("must not be greater than {} bytes", max));
                }
            }
            if let Some(min) = self.min_size {
                if size < min {
                    errors.add("size", format!("must not be less than {} bytes", min));
                }
            }
        } else if self.max_size.is_some() || self.min_size.is_some() {
            errors.add("size", "could not be determined");
        }

        match file.mime_type() {
            Some(mime_type) if !self.is_allowed(mime_type) => {
                errors.add("mime_type", format!("{} is not allowed", mime_type));
            }
            None if !self.allowed_mime_types.is_empty() => {
                errors.add("mime_type", "could not be determined");
            }
            _ => {}
        }

        if !self.allowed_extensions.is_empty() {
            let extension = file.filename().and_then(crate::uploaded_file::extension_of);
            match extension {
                Some(ext) if self.allowed_extensions.contains(&ext) => {}
                Some(ext) => errors.add("extension", format!("{} is not allowed", ext)),
                None => errors.add("extension", "is missing"),
            }
        }

        errors
    }
}

pub struct Validation;

impl Plugin for Validation {
    fn name(&self) -> &str {
        "validation"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Attacher]
    }

    fn default_options(&self) -> Options {
        let defaults = json!({
            "max_size": 100 * 1024 * 1024, // 100 MB
            "blocked_mime_types": ["application/x-msdownload", "application/x-executable"],
        });
        defaults.as_object().cloned().unwrap_or_default()
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        let rules = FileRules::from_options(options)?;
        if let (Some(min), Some(max)) = (rules.min_size, rules.max_size) {
            if min > max {
                return Err("min_size must not exceed max_size".to_string());
            }
        }
        Ok(PluginLayers::new().attacher(ValidationLayer { rules }))
    }
}

struct ValidationLayer {
    rules: FileRules,
}

impl AttacherLayer for ValidationLayer {
    fn validate(&self, attacher: &Attacher, data: &AttachmentData, next: AttacherNext<'_>) -> ValidationErrors {
        let mut errors = next.validate(attacher, data);
        if let Some(file) = data.main_file() {
            errors.merge(self.rules.check(file));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_uploader, options};
    use attache_core::{Metadata, RecordRef};
    use attache_storage::BytesIo;

    fn file(filename: &str, mime_type: Option<&str>, size: u64) -> UploadedFile {
        let mut metadata = Metadata::new();
        metadata.insert("filename".to_string(), json!(filename));
        metadata.insert("mime_type".to_string(), json!(mime_type));
        metadata.insert("size".to_string(), json!(size));
        UploadedFile::new("x", "cache", metadata)
    }

    #[test]
    fn test_default_rules_block_executables() {
        let rules = FileRules::from_options(&Validation.default_options()).unwrap();
        assert!(rules.is_allowed("image/png"));
        assert!(rules.is_allowed("application/pdf"));
        assert!(!rules.is_allowed("application/x-msdownload"));
    }

    #[test]
    fn test_size_and_type_rules() {
        let rules = FileRules::from_options(&options(json!({
            "max_size": 10,
            "min_size": 2,
            "allowed_mime_types": ["image/*", "application/pdf"],
            "allowed_extensions": [".JPG", "pdf"],
        })))
        .unwrap();

        assert!(rules.check(&file("a.jpg", Some("image/jpeg"), 5)).is_empty());
        assert!(rules.check(&file("a.PDF", Some("application/pdf"), 5)).is_empty());

        let errors = rules.check(&file("a.exe", Some("text/plain"), 50));
        assert!(errors.has_error("size"));
        assert!(errors.has_error("mime_type"));
        assert!(errors.has_error("extension"));

        assert!(rules.check(&file("a.jpg", None, 1)).has_error("size"));
        assert!(rules.check(&file("a.jpg", None, 5)).has_error("mime_type"));
    }

    #[test]
    fn test_invalid_options_fail_loading() {
        let (mut uploader, _, _) = memory_uploader();
        assert!(uploader
            .plugin("validation", options(json!({"max_size": "big"})))
            .is_err());
        assert!(uploader
            .plugin("validation", options(json!({"min_size": 10, "max_size": 5})))
            .is_err());
        assert!(!uploader.is_loaded("validation"));
    }

    #[tokio::test]
    async fn test_rejected_type_on_assign() {
        let (mut uploader, cache, _) = memory_uploader();
        uploader
            .plugin("validation", options(json!({"allowed_mime_types": ["image/png"]})))
            .unwrap();
        let mut attacher = uploader.attacher(RecordRef::new("User", 1), "avatar");

        let io = BytesIo::new("text").with_content_type("text/plain");
        let err = attacher.assign(io).await.unwrap_err();
        assert_eq!(
            err.validation_errors().unwrap().full_messages(),
            vec!["mime_type text/plain is not allowed".to_string()]
        );
        assert!(cache.is_empty().await);

        let io = BytesIo::new("png").with_content_type("image/png");
        attacher.assign(io).await.unwrap();
        assert!(attacher.cached().is_some());
    }
}
