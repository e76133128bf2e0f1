//! Processing plugin
//!
//! Runs the processors registered for the upload's action before the file
//! is stored. Processors run in registration order, each one receiving the
//! output of the previous one; a processor returning `None` leaves its
//! input as is.

use std::sync::Arc;

use async_trait::async_trait;
use attache_core::{Context, Options};
use attache_storage::{read_to_end, UploadIo};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::AttacheResult;
use crate::plugin::{Plugin, PluginLayers, Processed, Target, UploaderLayer, UploaderNext};

/// Transformation applied to an upload
#[async_trait]
pub trait Processor: Send + Sync {
    async fn call(&self, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Option<Processed>>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(Bytes, &Context) -> AttacheResult<Option<Processed>> + Send + Sync,
{
    async fn call(&self, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Option<Processed>> {
        let content = read_to_end(io).await?;
        (self.0)(content, ctx)
    }
}

/// Processor over the full content of the upload
pub fn from_fn<F>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Bytes, &Context) -> AttacheResult<Option<Processed>> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}

pub struct Processing;

impl Plugin for Processing {
    fn name(&self) -> &str {
        "processing"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader]
    }

    fn build(&self, _options: &Options) -> Result<PluginLayers, String> {
        Ok(PluginLayers::new().uploader(ProcessingLayer))
    }
}

struct ProcessingLayer;

async fn run(processor: &dyn Processor, io: &mut dyn UploadIo, ctx: &Context) -> AttacheResult<Option<Processed>> {
    io.rewind().await?;
    processor.call(io, ctx).await
}

#[async_trait]
impl UploaderLayer for ProcessingLayer {
    async fn process(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Option<Processed>> {
        let processors = next.uploader().processors(ctx.action);
        if processors.is_empty() {
            return next.process(io, ctx).await;
        }

        let mut current: Option<Processed> = None;
        for processor in processors {
            let result = match current.as_mut() {
                None => run(processor.as_ref(), io, ctx).await,
                Some(Processed::Single(inner)) => run(processor.as_ref(), inner.as_mut(), ctx).await,
                Some(Processed::Versions(_)) => {
                    debug!(action = %ctx.action, "Versions produced, skipping remaining processors");
                    break;
                }
            };

            match result {
                Ok(Some(output)) => {
                    if let Some(mut replaced) = current.replace(output) {
                        if let Err(e) = replaced.close().await {
                            warn!(error = %e, "Failed to close intermediate processing output");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if let Some(mut pending) = current {
                        if let Err(close_error) = pending.close().await {
                            warn!(error = %close_error, "Failed to close processing output");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(action = %ctx.action, processors = processors.len(), "Upload processed");
        Ok(current)
    }
}
