//! Backgrounding plugin
//!
//! Hands promotion and deletion of detached files to user-registered hooks
//! (usually enqueueing a job) instead of running them inline. Workers
//! rebuild the attacher from the [`BackgroundPayload`] and finish the work
//! with [`perform`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use attache_core::{Options, RecordRef};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::error::{AttacheError, AttacheResult};
use crate::model::ColumnStore;
use crate::plugin::{AttacherLayer, AttacherNext, Plugin, PluginLayers, Target};
use crate::uploader::Uploader;

/// Deferred operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundAction {
    Promote,
    Destroy,
}

/// Everything a worker needs to finish a deferred operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundPayload {
    pub action: BackgroundAction,
    pub uploader: String,
    pub record: RecordRef,
    pub name: String,
    pub cache: String,
    pub store: String,
    pub data: Value,
}

impl BackgroundPayload {
    pub fn attachment(&self) -> AttacheResult<AttachmentData> {
        AttachmentData::from_value(self.data.clone())
            .map_err(|e| AttacheError::CorruptColumn(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> AttacheResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| AttacheError::InvalidInput(format!("invalid background payload: {}", e)))
    }
}

/// Callback receiving deferred work
pub type BackgroundHook = Arc<dyn Fn(BackgroundPayload) -> BoxFuture<'static, AttacheResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`BackgroundHook`]
pub fn hook<F, Fut>(f: F) -> BackgroundHook
where
    F: Fn(BackgroundPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AttacheResult<()>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

/// Hooks registered on an uploader class
#[derive(Clone, Default)]
pub struct BackgroundHooks {
    pub promote: Option<BackgroundHook>,
    pub destroy: Option<BackgroundHook>,
}

/// Finish a deferred operation
///
/// Promotion is atomic: when the record's attachment changed since the
/// payload was created, the promoted files are discarded and
/// [`AttacheError::AttachmentChanged`] is returned.
pub async fn perform(uploader: &Uploader, columns: &dyn ColumnStore, payload: &BackgroundPayload) -> AttacheResult<()> {
    match payload.action {
        BackgroundAction::Promote => {
            let mut attacher = Attacher::from_payload(uploader.clone(), payload)?;
            attacher.atomic_promote(columns).await?;
            info!(record = %payload.record, name = %payload.name, "Background promotion finished");
            Ok(())
        }
        BackgroundAction::Destroy => {
            let data = payload.attachment()?;
            let attacher = uploader
                .attacher(payload.record.clone(), payload.name.clone())
                .with_storages(payload.cache.clone(), payload.store.clone());
            attacher.destroy_now(data).await?;
            info!(record = %payload.record, name = %payload.name, "Background deletion finished");
            Ok(())
        }
    }
}

pub struct Backgrounding;

impl Plugin for Backgrounding {
    fn name(&self) -> &str {
        "backgrounding"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Attacher]
    }

    fn build(&self, _options: &Options) -> Result<PluginLayers, String> {
        Ok(PluginLayers::new().attacher(BackgroundingLayer))
    }
}

struct BackgroundingLayer;

async fn dispatch(hook: &BackgroundHook, payload: BackgroundPayload) -> AttacheResult<()> {
    (**hook)(payload).await.map_err(|e| match e {
        AttacheError::Background(_) => e,
        other => AttacheError::Background(other.to_string()),
    })
}

#[async_trait]
impl AttacherLayer for BackgroundingLayer {
    async fn promote(&self, attacher: &mut Attacher, next: AttacherNext<'_>) -> AttacheResult<()> {
        let hook = attacher.uploader().background_hooks().promote.clone();
        match hook {
            Some(hook) => {
                let payload = attacher.to_payload(BackgroundAction::Promote)?;
                debug!(record = %payload.record, name = %payload.name, "Promotion deferred");
                dispatch(&hook, payload).await
            }
            None => next.promote(attacher).await,
        }
    }

    async fn destroy_attached(
        &self,
        attacher: &Attacher,
        data: AttachmentData,
        next: AttacherNext<'_>,
    ) -> AttacheResult<()> {
        let hook = attacher.uploader().background_hooks().destroy.clone();
        match hook {
            Some(hook) => {
                let payload = attacher.payload_for(BackgroundAction::Destroy, &data)?;
                debug!(record = %payload.record, name = %payload.name, ids = %data.ids(), "Deletion deferred");
                dispatch(&hook, payload).await
            }
            None => next.destroy_attached(attacher, data).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{save, Attachable, MemoryColumnStore};
    use crate::testing::counting_uploader;
    use attache_storage::BytesIo;
    use parking_lot::Mutex;

    struct Post {
        cover: Attacher,
    }

    impl Attachable for Post {
        fn record_ref(&self) -> RecordRef {
            RecordRef::new("Post", 3)
        }

        fn attachers(&self) -> Vec<&Attacher> {
            vec![&self.cover]
        }

        fn attachers_mut(&mut self) -> Vec<&mut Attacher> {
            vec![&mut self.cover]
        }
    }

    fn recording_hook(queue: Arc<Mutex<Vec<BackgroundPayload>>>) -> BackgroundHook {
        hook(move |payload| {
            let queue = queue.clone();
            async move {
                queue.lock().push(payload);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_promotion_is_deferred_and_performed() {
        let (mut uploader, _, store) = counting_uploader();
        let queue = Arc::new(Mutex::new(Vec::new()));
        uploader.plugin("backgrounding", Options::new()).unwrap();
        uploader.promote_block(recording_hook(queue.clone())).unwrap();

        let columns = MemoryColumnStore::new();
        let mut post = Post {
            cover: uploader.attacher(RecordRef::new("Post", 3), "cover"),
        };
        post.cover.assign(BytesIo::new("cover image")).await.unwrap();
        save(&columns, &mut post).await.unwrap();

        assert!(post.cover.cached().is_some());
        assert_eq!(store.puts(), 0);

        let payload = queue.lock().pop().unwrap();
        assert_eq!(payload.action, BackgroundAction::Promote);
        perform(&uploader, &columns, &payload).await.unwrap();

        let persisted = columns.read(&post.record_ref(), "cover").await.unwrap().unwrap();
        assert!(AttachmentData::from_json(&persisted).unwrap().is_on("store"));
        assert_eq!(store.puts(), 1);
    }

    #[tokio::test]
    async fn test_deletion_is_deferred() {
        let (mut uploader, _, store) = counting_uploader();
        let queue = Arc::new(Mutex::new(Vec::new()));
        uploader.plugin("backgrounding", Options::new()).unwrap();
        uploader.destroy_block(recording_hook(queue.clone())).unwrap();

        let mut attacher = uploader.attacher(RecordRef::new("Post", 3), "cover");
        attacher.assign(BytesIo::new("a")).await.unwrap();
        attacher.finalize().await.unwrap();
        let old = attacher.stored().unwrap().main_file().unwrap().id.clone();

        attacher.assign(BytesIo::new("b")).await.unwrap();
        attacher.finalize().await.unwrap();
        assert_eq!(store.deletes_of(&old), 0);

        let payload = queue.lock().pop().unwrap();
        assert_eq!(payload.action, BackgroundAction::Destroy);
        perform(&uploader, &MemoryColumnStore::new(), &payload).await.unwrap();
        assert_eq!(store.deletes_of(&old), 1);
    }

    #[tokio::test]
    async fn test_hook_failure_is_reported() {
        let (mut uploader, _, _) = counting_uploader();
        uploader.plugin("backgrounding", Options::new()).unwrap();
        uploader
            .promote_block(hook(|_| async { Err(AttacheError::Persistence("queue down".to_string())) }))
            .unwrap();

        let mut attacher = uploader.attacher(RecordRef::new("Post", 3), "cover");
        attacher.assign(BytesIo::new("a")).await.unwrap();
        let err = attacher.promote().await.unwrap_err();
        assert!(matches!(err, AttacheError::Background(_)));
        assert!(attacher.cached().is_some());
    }

    #[tokio::test]
    async fn test_without_hooks_runs_inline() {
        let (mut uploader, _, store) = counting_uploader();
        uploader.plugin("backgrounding", Options::new()).unwrap();

        let mut attacher = uploader.attacher(RecordRef::new("Post", 3), "cover");
        attacher.assign(BytesIo::new("a")).await.unwrap();
        attacher.promote().await.unwrap();
        assert!(attacher.stored().is_some());
        assert_eq!(store.puts(), 1);
    }
}
