//! Configuration for minibulk components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "minibulk.toml";

/// Prefix for environment overrides (`MINIBULK__ROUTER__MAX_BATCH_OPS=...`)
pub const ENV_PREFIX: &str = "MINIBULK";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Batching and retry policy
    #[serde(default)]
    pub router: RouterConfig,

    /// Known shards and their HTTP endpoints
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            shards: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// One shard the router can dispatch to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: String,
    /// Base URL, e.g. `http://127.0.0.1:7001`
    pub url: String,
}

/// Router (retry loop and batch builder) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive rounds allowed without completed ops or routing changes
    #[serde(default = "default_max_rounds_without_progress")]
    pub max_rounds_without_progress: usize,

    /// Maximum number of writes in one shard batch
    #[serde(default = "default_max_batch_ops")]
    pub max_batch_ops: usize,

    /// Maximum estimated payload of one shard batch
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Per-shard request timeout
    #[serde(default = "default_shard_timeout")]
    pub shard_timeout_ms: u64,
}

fn default_max_rounds_without_progress() -> usize {
    5
}
fn default_max_batch_ops() -> usize {
    100_000
}
fn default_max_batch_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_shard_timeout() -> u64 {
    30_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rounds_without_progress: default_max_rounds_without_progress(),
            max_batch_ops: default_max_batch_ops(),
            max_batch_bytes: default_max_batch_bytes(),
            shard_timeout_ms: default_shard_timeout(),
        }
    }
}

impl RouterConfig {
    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_ops == 0 {
            return Err(Error::InvalidConfig("max_batch_ops must be > 0".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::InvalidConfig("max_batch_bytes must be > 0".into()));
        }
        if self.shard_timeout_ms == 0 {
            return Err(Error::InvalidConfig("shard_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load `minibulk.toml` from the working directory (if present), then
    /// apply `MINIBULK__*` environment overrides.
    pub fn load() -> Result<Self> {
        Self::build(
            config::File::with_name(DEFAULT_CONFIG_FILE)
                .format(config::FileFormat::Toml)
                .required(false),
        )
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::InvalidConfig(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::build(config::File::from(path).format(config::FileFormat::Toml))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        for (i, shard) in self.shards.iter().enumerate() {
            if self.shards[..i].iter().any(|s| s.id == shard.id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate shard id: {}",
                    shard.id
                )));
            }
        }
        Ok(())
    }
}
