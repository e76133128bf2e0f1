//! Content signature plugin
//!
//! Adds a hex SHA-256 digest of the content to the metadata, under the
//! `sha256` key unless the `key` option says otherwise.

use async_trait::async_trait;
use attache_core::{Context, Metadata, Options};
use attache_storage::{UploadIo, CHUNK_SIZE};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::AttacheResult;
use crate::plugin::{string_option, Plugin, PluginLayers, Target, UploaderLayer, UploaderNext};

pub struct Signature;

impl Plugin for Signature {
    fn name(&self) -> &str {
        "signature"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        match string_option(options, "algorithm").unwrap_or("sha256") {
            "sha256" => {}
            other => return Err(format!("unsupported algorithm: {}", other)),
        }
        let key = string_option(options, "key").unwrap_or("sha256").to_string();
        Ok(PluginLayers::new().uploader(SignatureLayer { key }))
    }
}

struct SignatureLayer {
    key: String,
}

/// Hex SHA-256 of the remaining stream content; rewinds afterwards
pub async fn sha256_hex(io: &mut dyn UploadIo) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    while let Some(chunk) = io.read_chunk(CHUNK_SIZE).await? {
        hasher.update(&chunk);
    }
    io.rewind().await?;
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl UploaderLayer for SignatureLayer {
    async fn extract_metadata(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Metadata> {
        let mut metadata = next.extract_metadata(io, ctx).await?;
        if metadata.get(&self.key).map_or(true, Value::is_null) {
            io.rewind().await?;
            let digest = sha256_hex(io).await?;
            metadata.insert(self.key.clone(), Value::from(digest));
        }
        Ok(metadata)
    }
}
