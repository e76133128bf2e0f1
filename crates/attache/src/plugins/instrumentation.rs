//! Instrumentation plugin
//!
//! Emits a tracing event with the elapsed time for every upload, metadata
//! extraction, deletion, promotion and detached-file deletion. The
//! `log_level` option selects `info` (default) or `debug`.

use std::time::Instant;

use async_trait::async_trait;
use attache_core::{Context, Metadata, Options};
use attache_storage::{BoxIo, UploadIo};

use crate::attacher::Attacher;
use crate::attachment::AttachmentData;
use crate::error::AttacheResult;
use crate::plugin::{
    string_option, AttacherLayer, AttacherNext, Plugin, PluginLayers, Target, UploaderLayer,
    UploaderNext,
};
use crate::uploaded_file::UploadedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Debug,
}

macro_rules! emit {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::Info => tracing::info!($($arg)+),
            Level::Debug => tracing::debug!($($arg)+),
        }
    };
}

pub struct Instrumentation;

impl Plugin for Instrumentation {
    fn name(&self) -> &str {
        "instrumentation"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Uploader, Target::Attacher]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        let level = match string_option(options, "log_level").unwrap_or("info") {
            "info" => Level::Info,
            "debug" => Level::Debug,
            other => return Err(format!("unsupported log_level: {}", other)),
        };
        Ok(PluginLayers::new()
            .uploader(UploaderEvents { level })
            .attacher(AttacherEvents { level }))
    }
}

fn outcome<T>(result: &AttacheResult<T>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

struct UploaderEvents {
    level: Level,
}

#[async_trait]
impl UploaderLayer for UploaderEvents {
    async fn upload(
        &self,
        io: BoxIo,
        storage: &str,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<AttachmentData> {
        let started = Instant::now();
        let result = next.upload(io, storage, ctx).await;
        emit!(
            self.level,
            uploader = %next.uploader().name(),
            storage = storage,
            action = %ctx.action,
            outcome = outcome(&result),
            duration_ms = started.elapsed().as_millis() as u64,
            "upload"
        );
        result
    }

    async fn extract_metadata(
        &self,
        io: &mut dyn UploadIo,
        ctx: &Context,
        next: UploaderNext<'_>,
    ) -> AttacheResult<Metadata> {
        let started = Instant::now();
        let result = next.extract_metadata(io, ctx).await;
        emit!(
            self.level,
            uploader = %next.uploader().name(),
            action = %ctx.action,
            outcome = outcome(&result),
            duration_ms = started.elapsed().as_millis() as u64,
            "metadata"
        );
        result
    }

    async fn delete(&self, file: &UploadedFile, ctx: &Context, next: UploaderNext<'_>) -> AttacheResult<()> {
        let started = Instant::now();
        let result = next.delete(file, ctx).await;
        emit!(
            self.level,
            uploader = %next.uploader().name(),
            storage = %file.storage_name,
            id = %file.id,
            outcome = outcome(&result),
            duration_ms = started.elapsed().as_millis() as u64,
            "delete"
        );
        result
    }
}

struct AttacherEvents {
    level: Level,
}

#[async_trait]
impl AttacherLayer for AttacherEvents {
    async fn promote(&self, attacher: &mut Attacher, next: AttacherNext<'_>) -> AttacheResult<()> {
        let started = Instant::now();
        let result = next.promote(attacher).await;
        emit!(
            self.level,
            record = %attacher.record(),
            name = %attacher.name(),
            outcome = outcome(&result),
            duration_ms = started.elapsed().as_millis() as u64,
            "promote"
        );
        result
    }

    async fn destroy_attached(
        &self,
        attacher: &Attacher,
        data: AttachmentData,
        next: AttacherNext<'_>,
    ) -> AttacheResult<()> {
        let started = Instant::now();
        let ids = data.ids();
        let result = next.destroy_attached(attacher, data).await;
        emit!(
            self.level,
            record = %attacher.record(),
            name = %attacher.name(),
            ids = %ids,
            outcome = outcome(&result),
            duration_ms = started.elapsed().as_millis() as u64,
            "destroy"
        );
        result
    }
}
