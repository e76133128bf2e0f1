//! Configuration types and loading
//!
//! Process configuration: where storages live, attacher defaults, the
//! background job queue and logging. Per-class plugin configuration lives on
//! the uploader class instead.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AttacheConfig {
    /// Storage backends
    pub storage: StorageConfig,

    /// Attacher defaults
    pub attacher: AttacherConfig,

    /// Background jobs
    pub jobs: JobsConfig,

    /// Logging
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory backing the cache storage
    pub cache_dir: String,
    /// Directory backing the store storage
    pub store_dir: String,
    /// Public base URL files are served under
    pub base_url: String,
    /// Expiry for generated URLs
    pub url_expiry_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: "/var/attache/cache".to_string(),
            store_dir: "/var/attache/store".to_string(),
            base_url: "/uploads".to_string(),
            url_expiry_seconds: 3600, // 1 hour
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AttacherConfig {
    /// Storage holding freshly assigned files
    pub cache: String,
    /// Storage holding promoted files
    pub store: String,
    /// Check that assigned cached references exist on the cache storage
    pub verify_cached_existence: bool,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            cache: "cache".to_string(),
            store: "store".to_string(),
            verify_cached_existence: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobsConfig {
    pub queue: String,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue: "attache".to_string(),
            max_retries: 3,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,attache=debug".to_string(),
            json: false,
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Config file error: {0}")]
    FileError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::FileError(err.to_string())
    }
}

impl AttacheConfig {
    /// Load configuration from environment variables
    ///
    /// Variables use the `ATTACHE__SECTION__KEY` layout, e.g.
    /// `ATTACHE__ATTACHER__STORE=s3`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(Self::environment())
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then an optional TOML file, then the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(Self::environment())
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("ATTACHE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Reject configurations the attacher cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attacher.cache.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "attacher.cache".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.attacher.store.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "attacher.store".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.attacher.cache == self.attacher.store {
            return Err(ConfigError::InvalidValue {
                key: "attacher.store".to_string(),
                message: "must differ from the cache storage".to_string(),
            });
        }
        Ok(())
    }
}
