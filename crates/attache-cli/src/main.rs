//! Attache command line tool
//!
//! Caches local files, promotes cached references to the store, prints
//! URLs and deletes files. Storages are local directories taken from the
//! configuration file; references are passed around as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use attache::{
    Action, AttachmentData, ColumnStore, Context, FileIo, MemoryColumnStore, Options, PluginRegistry,
    RecordRef, StorageRegistry, Uploader,
};
use attache_core::config::{AttacheConfig, LoggingConfig};
use attache_jobs::{enqueue_promote, JobQueue, JobStatus, JobWorker, MemoryJobQueue, PromoteJob, Uploaders, PROMOTE_JOB};
use attache_storage::LocalStorage;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const UPLOADER: &str = "CliUploader";
const ATTACHMENT: &str = "file";

#[derive(Parser, Debug)]
#[command(name = "attache", about = "Manage file attachments on local storages")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "attache.toml", env = "ATTACHE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file to the cache storage and print its cached reference.
    Cache {
        path: PathBuf,
        /// Content type reported for the file.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Promote a cached reference to the store storage.
    Promote {
        /// Cached reference JSON.
        data: String,
        /// Route the promotion through the background job queue.
        #[arg(long)]
        background: bool,
    },
    /// Print the URL of a referenced file.
    Url {
        data: String,
        #[arg(long)]
        version: Option<String>,
        /// Host prepended to the URL.
        #[arg(long)]
        host: Option<String>,
    },
    /// Delete every file of a reference.
    Delete { data: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AttacheConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(&config.logging);

    let uploader = build_uploader(&config)?;
    let output = run(cli.command, uploader, &config).await?;
    println!("{}", output);
    Ok(())
}

/// Initialize tracing/logging on stderr, keeping stdout for command output
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn build_uploader(config: &AttacheConfig) -> Result<Uploader> {
    let base_url = config.storage.base_url.trim_end_matches('/');
    let cache = LocalStorage::new(&config.storage.cache_dir, format!("{}/{}", base_url, config.attacher.cache));
    let store = LocalStorage::new(&config.storage.store_dir, format!("{}/{}", base_url, config.attacher.store));
    let storages = StorageRegistry::new()
        .with(config.attacher.cache.clone(), Arc::new(cache))
        .with(config.attacher.store.clone(), Arc::new(store));

    let mut uploader = Uploader::with_registries(UPLOADER, storages, PluginRegistry::with_builtins())
        .with_plugin("determine_mime_type", Options::new())?
        .with_plugin("signature", Options::new())?
        .with_plugin("validation", Options::new())?
        .with_plugin("backgrounding", Options::new())?
        .with_plugin("instrumentation", Options::new())?;
    uploader.configure(&config.attacher);
    Ok(uploader)
}

fn parse(data: &str) -> Result<AttachmentData> {
    AttachmentData::from_json(data).context("invalid attachment reference")
}

async fn run(command: Commands, uploader: Uploader, config: &AttacheConfig) -> Result<String> {
    match command {
        Commands::Cache { path, content_type } => cache(&uploader, path, content_type).await,
        Commands::Promote { data, background } => promote(uploader, parse(&data)?, background, config).await,
        Commands::Url { data, version, host } => url(&uploader, &parse(&data)?, version, host).await,
        Commands::Delete { data } => delete(&uploader, &parse(&data)?).await,
    }
}

async fn cache(uploader: &Uploader, path: PathBuf, content_type: Option<String>) -> Result<String> {
    let mut io = FileIo::open(&path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    if let Some(content_type) = content_type {
        io = io.with_content_type(content_type);
    }

    let mut attacher = uploader.attacher(RecordRef::unsaved("Cli"), ATTACHMENT);
    attacher.assign(io).await?;
    attacher.cached_data().context("nothing was cached")
}

async fn promote(
    mut uploader: Uploader,
    data: AttachmentData,
    background: bool,
    config: &AttacheConfig,
) -> Result<String> {
    let record = RecordRef::new("Cli", 1);

    if !background {
        let mut attacher = uploader.attacher(record, ATTACHMENT);
        attacher.assign(data).await?;
        attacher.finalize().await?;
        attacher.cleanup().await?;
        return attacher.column_data().map(str::to_string).context("nothing was promoted");
    }

    let queue = Arc::new(MemoryJobQueue::new());
    let columns = Arc::new(MemoryColumnStore::new());
    uploader.promote_block(enqueue_promote(queue.clone(), &config.jobs))?;

    let mut attacher = uploader.attacher(record.clone(), ATTACHMENT);
    attacher.assign(data).await?;
    columns.write(&record, ATTACHMENT, attacher.column_data()).await?;
    attacher.promote().await?;

    let mut worker = JobWorker::from_config(queue.clone(), &config.jobs);
    worker.register(
        PROMOTE_JOB,
        PromoteJob::new(Uploaders::new().with(uploader.clone()), columns.clone()),
    );
    let processed = worker.drain().await?;
    info!(jobs = processed, "Background jobs processed");

    let jobs = queue.list(worker.queue_name(), None).await?;
    if let Some(job) = jobs.into_iter().find(|job| job.status != JobStatus::Completed) {
        bail!("promotion failed: {}", job.error.unwrap_or_default());
    }
    columns
        .read(&record, ATTACHMENT)
        .await?
        .context("nothing was promoted")
}

async fn url(
    uploader: &Uploader,
    data: &AttachmentData,
    version: Option<String>,
    host: Option<String>,
) -> Result<String> {
    let file = match version {
        Some(version) => data
            .version(&version)
            .with_context(|| format!("no version named {}", version))?,
        None => data.main_file().context("empty attachment reference")?,
    };

    let mut options = Options::new();
    if let Some(host) = host {
        options.insert("host".to_string(), serde_json::Value::String(host));
    }
    Ok(uploader.url(file, &options).await?)
}

async fn delete(uploader: &Uploader, data: &AttachmentData) -> Result<String> {
    let ctx = Context::new(Action::Destroy);
    for file in data.files() {
        uploader.delete(file, &ctx).await?;
    }
    Ok(data.ids())
}
