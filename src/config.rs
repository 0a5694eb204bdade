//! Process configuration for the `workqueue` binary.
//!
//! ## Resolution order
//!
//! 1. Environment variables (`WORKQUEUE_*`, `S3_ENDPOINT`, `S3_REGION`)
//! 2. The TOML file passed to [`load_config`], if any
//! 3. Built-in defaults

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatcher::DispatchSettings;
use crate::inmem::InMemoryQueue;
use crate::objectstore::ObjectStoreQueue;
use crate::queue::{
    QueueConfig, WorkQueue, DEFAULT_BACKOFF_PERIOD, DEFAULT_MAXIMUM_BACKOFF_PERIOD,
    DEFAULT_REFRESH_INTERVAL,
};
use crate::storage::{ObjectStore, S3Client, S3Config, StorageError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// An environment variable held an unusable value.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
    /// The resolved configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    /// The storage backend could not be set up.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Which backend holds the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// S3-compatible object store.
    #[default]
    #[serde(alias = "gcs")]
    S3,
    /// Process-local memory; nothing survives a restart.
    #[serde(rename = "inmem", alias = "in-memory")]
    InMemory,
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" | "gcs" => Ok(Self::S3),
            "inmem" | "in-memory" => Ok(Self::InMemory),
            other => Err(format!("unknown queue mode '{other}' (use s3 or inmem)")),
        }
    }
}

/// Dispatch section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSection {
    /// Maximum keys in progress at once.
    pub concurrency: usize,
    /// Maximum keys launched per round; 0 for no cap.
    pub batch_size: usize,
    /// Attempts before dead-lettering; 0 for unlimited.
    pub max_retry: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 0,
            max_retry: 0,
        }
    }
}

/// Queue timing section, in whole seconds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingSection {
    /// Base backoff after a failure.
    pub backoff_secs: u64,
    /// Backoff ceiling.
    pub max_backoff_secs: u64,
    /// Lease renewal interval.
    pub refresh_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            backoff_secs: DEFAULT_BACKOFF_PERIOD.as_secs(),
            max_backoff_secs: DEFAULT_MAXIMUM_BACKOFF_PERIOD.as_secs(),
            refresh_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkqueueConfig {
    /// Backend selection.
    pub mode: QueueMode,
    /// Bucket holding the queue objects (S3 mode).
    pub bucket: String,
    /// Optional custom endpoint (e.g., LocalStack/MinIO).
    pub endpoint: Option<String>,
    /// AWS region.
    pub region: String,
    /// Maximum queued keys returned per enumeration.
    pub limit: usize,
    /// Dispatcher knobs.
    pub dispatch: DispatchSection,
    /// Backoff and lease timing.
    pub queue: TimingSection,
}

impl Default for WorkqueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            limit: 1000,
            dispatch: DispatchSection::default(),
            queue: TimingSection::default(),
        }
    }
}

impl WorkqueueConfig {
    /// Parses a TOML document; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::TomlParse` if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Timing handed to backends and the dispatcher.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_backoff(
                Duration::from_secs(self.queue.backoff_secs),
                Duration::from_secs(self.queue.max_backoff_secs),
            )
            .with_refresh_interval(Duration::from_secs(self.queue.refresh_secs))
    }

    /// Dispatcher settings.
    #[must_use]
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings::new(self.dispatch.concurrency)
            .with_batch_size(self.dispatch.batch_size)
            .with_max_retry(self.dispatch.max_retry)
            .with_config(self.queue_config())
    }

    /// Checks the resolved configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.mode == QueueMode::S3 && self.bucket.is_empty() {
            errors.push("bucket: not configured (set WORKQUEUE_BUCKET or add to config file)".to_string());
        }
        if self.dispatch.concurrency == 0 {
            errors.push("dispatch.concurrency: must be at least 1".to_string());
        }
        if self.limit == 0 {
            errors.push("limit: must be at least 1".to_string());
        }
        if let Err(err) = self.queue_config().validate() {
            errors.push(format!("queue: {err}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidEnv` for values that do not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("WORKQUEUE_MODE") {
            self.mode = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "WORKQUEUE_MODE",
                value,
            })?;
        }
        if let Some(bucket) = lookup("WORKQUEUE_BUCKET") {
            self.bucket = bucket;
        }
        if let Some(endpoint) = lookup("S3_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(region) = lookup("S3_REGION") {
            self.region = region;
        }

        parse_env(&lookup, "WORKQUEUE_LIMIT", &mut self.limit)?;
        parse_env(&lookup, "WORKQUEUE_CONCURRENCY", &mut self.dispatch.concurrency)?;
        parse_env(&lookup, "WORKQUEUE_BATCH_SIZE", &mut self.dispatch.batch_size)?;
        parse_env(&lookup, "WORKQUEUE_MAX_RETRY", &mut self.dispatch.max_retry)?;
        parse_env(&lookup, "WORKQUEUE_BACKOFF_SECS", &mut self.queue.backoff_secs)?;
        parse_env(&lookup, "WORKQUEUE_MAX_BACKOFF_SECS", &mut self.queue.max_backoff_secs)?;
        parse_env(&lookup, "WORKQUEUE_REFRESH_SECS", &mut self.queue.refresh_secs)?;
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, var: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(var) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })?;
    }
    Ok(())
}

/// Loads the optional config file, then applies process environment
/// overrides and validates the result.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, an environment
/// value is malformed, or validation fails.
pub fn load_config(path: Option<&Path>) -> Result<WorkqueueConfig, ConfigError> {
    let mut config = match path {
        Some(path) => WorkqueueConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => WorkqueueConfig::default(),
    };
    config.apply_env(|var| env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

/// Builds the queue backend selected by `config`.
///
/// # Errors
/// Returns `ConfigError::Storage` if the S3 client cannot be created and
/// `ConfigError::Invalid` if the queue timing is unusable.
pub async fn connect(config: &WorkqueueConfig) -> Result<Arc<dyn WorkQueue>, ConfigError> {
    match config.mode {
        QueueMode::InMemory => {
            info!(limit = config.limit, "Using in-memory queue");
            Ok(Arc::new(InMemoryQueue::new(config.limit)))
        }
        QueueMode::S3 => {
            let client = S3Client::new(S3Config::new(
                config.endpoint.clone(),
                config.bucket.clone(),
                config.region.clone(),
            ))
            .await?;
            info!(bucket = %client.bucket(), limit = config.limit, "Using object-store queue");
            let store: Arc<dyn ObjectStore> = Arc::new(client);
            let queue = ObjectStoreQueue::new(store, config.limit, config.queue_config())
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            Ok(Arc::new(queue))
        }
    }
}
