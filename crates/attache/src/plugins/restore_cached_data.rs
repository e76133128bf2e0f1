//! Restore cached data plugin
//!
//! Metadata in a client-submitted cached reference is untrusted. This
//! plugin re-extracts it from the cached content before the reference is
//! assigned.

use async_trait::async_trait;
use attache_core::{Action, Options};
use indexmap::IndexMap;

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::error::AttacheResult;
use crate::plugin::{AttacherLayer, AttacherNext, Plugin, PluginLayers, Target};

pub struct RestoreCachedData;

impl Plugin for RestoreCachedData {
    fn name(&self) -> &str {
        "restore_cached_data"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Attacher]
    }

    fn build(&self, _options: &Options) -> Result<PluginLayers, String> {
        Ok(PluginLayers::new().attacher(RestoreLayer))
    }
}

struct RestoreLayer;

#[async_trait]
impl AttacherLayer for RestoreLayer {
    async fn assign_cached(
        &self,
        attacher: &Attacher,
        data: AttachmentData,
        next: AttacherNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        let data = next.assign_cached(attacher, data).await?;
        let uploader = attacher.uploader();
        let ctx = attacher.context(Action::Cache);

        match data {
            AttachmentData::Single(file) => Ok(AttachmentData::Single(
                uploader.refresh_metadata(&file, &ctx).await?,
            )),
            AttachmentData::Versions(versions) => {
                let mut refreshed = IndexMap::new();
                for (version, file) in versions {
                    let file = uploader
                        .refresh_metadata(&file, &ctx.with_version(version.as_str()))
                        .await?;
                    refreshed.insert(version, file);
                }
                Ok(AttachmentData::Versions(refreshed))
            }
        }
    }
}
