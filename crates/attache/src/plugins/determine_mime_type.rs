//! MIME type detection
//!
//! Fills `mime_type` from the original filename's extension. With the
//! `overwrite` option the detected type replaces the client-provided one,
//! which should not be trusted for anything security relevant.

use async_trait::async_trait;
use attache_core::{metadata_keys, Context, Metadata, Options};
use attache_storage::UploadIo;
use serde_json::Value;

use crate::error::AttacheResult;
use crate::plugin::{bool_option, Plugin, PluginLayers, Target, UploaderLayer, UploaderNext};

pub struct DetermineMimeType;

impl Plugin for DetermineMimeType {
    fn name(&self) -> &str {
        "determine_mime_type"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        let overwrite = bool_option(options, "overwrite")?.unwrap_or(false);
        Ok(PluginLayers::new().uploader(MimeTypeLayer { overwrite }))
    }
}

struct MimeTypeLayer {
    overwrite: bool,
}

/// Guess a MIME type from a filename's extension
pub fn guess(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

#[async_trait]
impl UploaderLayer for MimeTypeLayer {
    async fn extract_metadata(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Metadata> {
        let mut metadata = next.extract_metadata(io, ctx).await?;

        let missing = metadata
            .get(metadata_keys::MIME_TYPE)
            .map_or(true, Value::is_null);
        if !(missing || self.overwrite) {
            return Ok(metadata);
        }

        let detected = metadata
            .get(metadata_keys::FILENAME)
            .and_then(Value::as_str)
            .and_then(guess);
        if let Some(mime_type) = detected {
            metadata.insert(metadata_keys::MIME_TYPE.to_string(), Value::from(mime_type));
        }
        Ok(metadata)
    }
}
