//! URL options plugin
//!
//! Per-storage default URL options, keyed by storage name. Options passed
//! to the URL call win over the defaults.

use async_trait::async_trait;
use attache_core::Options;

use crate::error::AttacheResult;
use crate::plugin::{FileLayer, FileNext, Plugin, PluginLayers, Target};
use crate::uploaded_file::UploadedFile;

pub struct UrlOptions;

impl Plugin for UrlOptions {
    fn name(&self) -> &str {
        "url_options"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::File]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        for (storage, defaults) in options {
            if !defaults.is_object() {
                return Err(format!("options for {} must be an object", storage));
            }
        }
        Ok(PluginLayers::new().file(UrlOptionsLayer {
            defaults: options.clone(),
        }))
    }
}

struct UrlOptionsLayer {
    defaults: Options,
}

#[async_trait]
impl FileLayer for UrlOptionsLayer {
    async fn url(&self, file: &UploadedFile, options: &Options, next: FileNext<'_>) -> AttacheResult<String> {
        match self.defaults.get(&file.storage_name).and_then(|value| value.as_object()) {
            Some(defaults) => {
                let mut merged = defaults.clone();
                for (key, value) in options {
                    merged.insert(key.clone(), value.clone());
                }
                next.url(file, &merged).await
            }
            None => next.url(file, options).await,
        }
    }
}
