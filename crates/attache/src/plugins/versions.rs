//! Versions plugin
//!
//! Lets processors return a named set of files. Each version is stored
//! separately and the attachment column holds the version map.

use async_trait::async_trait;
use attache_core::{Action, Context, Options};
use indexmap::IndexMap;
use tracing::warn;

use crate::attachment::AttachmentData;
use crate::error::{AttacheError, AttacheResult};
use crate::plugin::{Dependency, Plugin, PluginLayers, Processed, Target, UploaderLayer, UploaderNext};

pub struct Versions;

impl Plugin for Versions {
    fn name(&self) -> &str {
        "versions"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader]
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::new("processing")]
    }

    fn build(&self, _options: &Options) -> Result<PluginLayers, String> {
        Ok(PluginLayers::new().uploader(VersionsLayer))
    }
}

struct VersionsLayer;

#[async_trait]
impl UploaderLayer for VersionsLayer {
    async fn store_processed(
        &self,
        processed: Processed,
        storage: &str,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        let versions = match processed {
            Processed::Versions(versions) => versions,
            single => return next.store_processed(single, storage, ctx).await,
        };
        if versions.is_empty() {
            return Err(AttacheError::InvalidInput(
                "processing produced no versions".to_string(),
            ));
        }

        let uploader = next.uploader();
        let mut stored = IndexMap::new();
        let mut failure = None;

        for (version, mut io) in versions {
            if failure.is_none() {
                match uploader
                    .upload_file(io.as_mut(), storage, &ctx.with_version(version.as_str()))
                    .await
                {
                    Ok(file) => {
                        stored.insert(version.clone(), file);
                    }
                    Err(e) => failure = Some(e),
                }
            }
            if let Err(e) = io.close().await {
                warn!(version = %version, error = %e, "Failed to close version stream");
            }
        }

        if let Some(e) = failure {
            let cleanup = ctx.with_action(Action::Destroy);
            for file in stored.values() {
                if let Err(delete_error) = uploader.delete(file, &cleanup).await {
                    warn!(id = %file.id, error = %delete_error, "Failed to delete partially stored version");
                }
            }
            return Err(e);
        }

        Ok(AttachmentData::Versions(stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::processing::from_fn;
    use crate::testing::{counting_uploader, memory_uploader};
    use attache_core::RecordRef;
    use attache_storage::BytesIo;

    fn thumbnails() -> std::sync::Arc<dyn crate::plugins::processing::Processor> {
        from_fn(|content, _| {
            let mut versions = IndexMap::new();
            versions.insert(
                "original".to_string(),
                BytesIo::new(content.clone()).with_filename("photo.jpg").boxed(),
            );
            versions.insert(
                "thumb".to_string(),
                BytesIo::new(content.slice(..1)).with_filename("photo.jpg").boxed(),
            );
            Ok(Some(Processed::Versions(versions)))
        })
    }

    #[test]
    fn test_loads_processing_dependency() {
        let (mut uploader, _, _) = memory_uploader();
        uploader.plugin("versions", Options::new()).unwrap();
        assert_eq!(uploader.plugins(), vec!["processing", "versions"]);
    }

    #[tokio::test]
    async fn test_versions_stored_on_promote() {
        let (mut uploader, _, store) = memory_uploader();
        uploader.plugin("versions", Options::new()).unwrap();
        uploader.add_processor(Action::Store, thumbnails()).unwrap();

        let mut attacher = uploader.attacher(RecordRef::new("Photo", 1), "image");
        attacher.assign(BytesIo::new("pixels").with_filename("photo.jpg")).await.unwrap();
        attacher.promote().await.unwrap();

        let data = attacher.stored().unwrap();
        assert!(data.is_versions());
        assert_eq!(data.version("thumb").unwrap().size(), Some(1));
        assert_eq!(data.main_file().unwrap().size(), Some(6));
        assert_eq!(store.len().await, 2);

        let reparsed = AttachmentData::from_json(attacher.column_data().unwrap()).unwrap();
        assert_eq!(&reparsed, data);
    }

    #[tokio::test]
    async fn test_cached_versions_promote_individually() {
        let (mut uploader, _, store) = memory_uploader();
        uploader.plugin("versions", Options::new()).unwrap();
        uploader.add_processor(Action::Cache, thumbnails()).unwrap();

        let mut attacher = uploader.attacher(RecordRef::new("Photo", 1), "image");
        attacher.assign(BytesIo::new("pixels")).await.unwrap();
        assert!(attacher.cached().unwrap().is_versions());

        attacher.promote().await.unwrap();
        let stored = attacher.stored().unwrap();
        assert_eq!(stored.files().len(), 2);
        assert_eq!(stored.version("thumb").unwrap().size(), Some(1));
        assert_eq!(store.len().await, 2);

        let url = attacher.version_url("thumb", &Options::new()).await.unwrap().unwrap();
        assert!(url.starts_with("memory://"));
    }

    #[tokio::test]
    async fn test_failed_version_cleans_up() {
        let (mut uploader, _, _) = counting_uploader();
        let broken = std::sync::Arc::new(crate::testing::CountingStorage::new().failing_puts());
        uploader.storages().register("broken", broken.clone());
        uploader.plugin("versions", Options::new()).unwrap();
        uploader.add_processor(Action::Store, thumbnails()).unwrap();

        let result = uploader
            .upload(BytesIo::new("pixels").boxed(), "broken", &Context::new(Action::Store))
            .await;
        assert!(result.is_err());
        assert_eq!(broken.puts(), 1);
    }
}
