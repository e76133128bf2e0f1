//! Pretty location plugin
//!
//! Generates locations of the form
//! `[namespace/]<record_type>/<record_id>/<name>/[<version>-]<uuid>[.ext]`
//! when the upload belongs to a record, falling back to the default
//! location otherwise.

use attache_core::{metadata_keys, Context, Metadata, Options};
use serde_json::Value;
use uuid::Uuid;

use crate::plugin::{string_option, Plugin, PluginLayers, Target, UploaderLayer, UploaderNext};
use crate::uploaded_file::extension_of;

pub struct PrettyLocation;

impl Plugin for PrettyLocation {
    fn name(&self) -> &str {
        "pretty_location"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        let namespace = string_option(options, "namespace")
            .map(|namespace| namespace.trim_matches('/').to_string())
            .filter(|namespace| !namespace.is_empty());
        Ok(PluginLayers::new().uploader(PrettyLocationLayer { namespace }))
    }
}

struct PrettyLocationLayer {
    namespace: Option<String>,
}

/// `BlogPost` becomes `blog_post`
fn underscore(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (index, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else if ch == ':' || ch == '-' {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(ch);
        }
    }
    out
}

impl UploaderLayer for PrettyLocationLayer {
    fn generate_location(&self, metadata: &Metadata, ctx: &Context, next: UploaderNext<'_>) -> String {
        let record = match &ctx.record {
            Some(record) => record,
            None => return next.generate_location(metadata, ctx),
        };

        let mut parts = Vec::new();
        if let Some(namespace) = &self.namespace {
            parts.push(namespace.clone());
        }
        parts.push(underscore(&record.record_type));
        if let Some(id) = &record.id {
            parts.push(id.clone());
        }
        if let Some(name) = &ctx.name {
            parts.push(name.clone());
        }

        let extension = metadata
            .get(metadata_keys::FILENAME)
            .and_then(Value::as_str)
            .and_then(extension_of)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        let basename = match &ctx.version {
            Some(version) => format!("{}-{}{}", version, Uuid::new_v4().simple(), extension),
            None => format!("{}{}", Uuid::new_v4().simple(), extension),
        };
        parts.push(basename);

        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_uploader, options};
    use attache_core::{Action, RecordRef};
    use serde_json::json;

    #[test]
    fn test_underscore() {
        assert_eq!(underscore("BlogPost"), "blog_post");
        assert_eq!(underscore("Admin::User"), "admin_user");
        assert_eq!(underscore("photo"), "photo");
    }

    #[test]
    fn test_record_based_location() {
        let (mut uploader, _, _) = memory_uploader();
        uploader
            .plugin("pretty_location", options(json!({"namespace": "/uploads/"})))
            .unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("filename".to_string(), json!("Me.PNG"));
        let ctx = Context::new(Action::Store)
            .record(RecordRef::new("UserProfile", 12))
            .name("avatar");

        let location = uploader.generate_location(&metadata, &ctx.with_version("thumb"));
        assert!(location.starts_with("uploads/user_profile/12/avatar/thumb-"));
        assert!(location.ends_with(".png"));

        let plain = uploader.generate_location(&metadata, &Context::new(Action::Cache));
        assert!(!plain.contains('/'));
    }
}
