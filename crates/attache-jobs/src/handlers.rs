//! Promote and destroy jobs
//!
//! The `backgrounding` plugin hands a [`BackgroundPayload`] to a hook. The
//! hooks built here turn payloads into queued jobs; the handlers rebuild
//! the attacher on a worker and finish the operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use attache::plugins::backgrounding::{hook, perform};
use attache::{AttacheError, Attacher, BackgroundAction, BackgroundHook, BackgroundPayload, ColumnStore, Uploader};
use attache_core::config::JobsConfig;
use serde_json::Value;
use tracing::{info, instrument};

use crate::jobs::{Job, JobError, JobHandler, JobPriority, JobQueue, JobResult};

pub const PROMOTE_JOB: &str = "attache.promote";
pub const DESTROY_JOB: &str = "attache.destroy";

/// Uploader classes a worker can resolve payloads against
#[derive(Clone, Default)]
pub struct Uploaders {
    classes: HashMap<String, Uploader>,
}

impl Uploaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uploader: Uploader) -> Self {
        self.classes.insert(uploader.name().to_string(), uploader);
        self
    }

    pub fn get(&self, name: &str) -> JobResult<&Uploader> {
        self.classes
            .get(name)
            .ok_or_else(|| JobError::Failed(format!("unknown uploader class: {}", name)))
    }
}

fn payload(args: Value, expected: BackgroundAction) -> JobResult<BackgroundPayload> {
    let payload: BackgroundPayload = serde_json::from_value(args)?;
    if payload.action != expected {
        return Err(JobError::Failed(format!(
            "expected a {:?} payload, got {:?}",
            expected, payload.action
        )));
    }
    Ok(payload)
}

/// Promotes a cached attachment and persists it if the record still holds it
pub struct PromoteJob {
    uploaders: Uploaders,
    columns: Arc<dyn ColumnStore>,
}

impl PromoteJob {
    pub fn new(uploaders: Uploaders, columns: Arc<dyn ColumnStore>) -> Self {
        Self { uploaders, columns }
    }
}

#[async_trait]
impl JobHandler for PromoteJob {
    #[instrument(skip_all)]
    async fn handle(&self, args: Value) -> JobResult<()> {
        let payload = payload(args, BackgroundAction::Promote)?;
        let uploader = self.uploaders.get(&payload.uploader)?;

        match perform(uploader, self.columns.as_ref(), &payload).await {
            Ok(()) => Ok(()),
            // Nothing left to do for a superseded attachment
            Err(AttacheError::AttachmentChanged) => {
                info!(record = %payload.record, name = %payload.name, "Attachment changed, promotion discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Deletes files detached from a record
pub struct DestroyJob {
    uploaders: Uploaders,
}

impl DestroyJob {
    pub fn new(uploaders: Uploaders) -> Self {
        Self { uploaders }
    }
}

#[async_trait]
impl JobHandler for DestroyJob {
    #[instrument(skip_all)]
    async fn handle(&self, args: Value) -> JobResult<()> {
        let payload = payload(args, BackgroundAction::Destroy)?;
        let uploader = self.uploaders.get(&payload.uploader)?;
        let data = payload.attachment()?;

        Attacher::new(uploader.clone(), payload.record.clone(), payload.name.clone())
            .with_storages(payload.cache.clone(), payload.store.clone())
            .destroy_now(data)
            .await?;
        Ok(())
    }
}

fn enqueue<Q: JobQueue + 'static>(
    queue: Arc<Q>,
    job_type: &'static str,
    priority: JobPriority,
    config: &JobsConfig,
) -> BackgroundHook {
    let queue_name = config.queue.clone();
    let max_retries = config.max_retries;

    hook(move |payload: BackgroundPayload| {
        let queue = queue.clone();
        let queue_name = queue_name.clone();
        async move {
            let args = serde_json::to_value(&payload).map_err(|e| AttacheError::Background(e.to_string()))?;
            let job = Job::new(job_type, args)
                .queue(queue_name)
                .priority(priority)
                .max_retries(max_retries);
            queue
                .enqueue(job)
                .await
                .map_err(|e| AttacheError::Background(e.to_string()))?;
            Ok(())
        }
    })
}

/// Hook for `Uploader::promote_block` that queues a [`PROMOTE_JOB`]
pub fn enqueue_promote<Q: JobQueue + 'static>(queue: Arc<Q>, config: &JobsConfig) -> BackgroundHook {
    enqueue(queue, PROMOTE_JOB, JobPriority::Normal, config)
}

/// Hook for `Uploader::destroy_block` that queues a [`DESTROY_JOB`]
pub fn enqueue_destroy<Q: JobQueue + 'static>(queue: Arc<Q>, config: &JobsConfig) -> BackgroundHook {
    enqueue(queue, DESTROY_JOB, JobPriority::Low, config)
}
