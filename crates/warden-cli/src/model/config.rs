//! Configuration management for the Warden CLI
//!
//! Sources, lowest precedence first:
//! 1. `conf/application.yml` (or the file given with `--config`), optional
//! 2. `WARDEN__*` environment variables (`WARDEN__LOCK__KEY_PREFIX=billing`)
//! 3. Command line overrides

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::Rotation;
use warden_lock::CoordinatorConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Run commands under a quorum-backed distributed lock")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Lock storage nodes, comma separated (overrides `lock.nodes`)
    #[arg(long = "nodes", value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Lock key prefix (overrides `lock.key_prefix`)
    #[arg(long = "key-prefix")]
    pub key_prefix: Option<String>,

    /// Log level (overrides `logging.level`)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a command while holding a lock
    Run(RunArgs),
    /// Print the TTL in milliseconds that a lock would get
    ResolveTtl {
        /// Milliseconds or cron expression; the configured default when omitted
        spec: Option<String>,
    },
    /// Acquire and release a lock to check that a quorum is reachable
    Probe {
        #[arg(long, default_value = "warden-probe")]
        key: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Static lock key
    #[arg(short = 'k', long = "key")]
    pub key: String,

    /// Extra key segment, e.g. a tenant id
    #[arg(short = 's', long = "segment")]
    pub segment: Option<String>,

    /// Lock TTL: milliseconds or cron expression
    #[arg(long = "ttl")]
    pub ttl: Option<String>,

    /// Fail instead of skipping when the lock is held elsewhere
    #[arg(long = "throw")]
    pub throw: bool,

    /// Release the lock when the command finishes
    #[arg(long = "release", conflicts_with = "retain")]
    pub release: bool,

    /// Keep the lock until its TTL elapses
    #[arg(long = "retain")]
    pub retain: bool,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Release override from `--release` / `--retain`
    pub fn release_override(&self) -> Option<bool> {
        match (self.release, self.retain) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub console: bool,
    pub file: bool,
    pub dir: PathBuf,
    pub rotation: LogRotation,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: false,
            dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub lock: CoordinatorConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(cli.config.as_path()).required(false))
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("lock.nodes")
                    .try_parsing(true),
            );

        if !cli.nodes.is_empty() {
            builder = builder.set_override("lock.nodes", cli.nodes.clone())?;
        }
        if let Some(prefix) = &cli.key_prefix {
            builder = builder.set_override("lock.key_prefix", prefix.as_str())?;
        }
        if let Some(level) = &cli.log_level {
            builder = builder.set_override("logging.level", level.as_str())?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.lock.validate()?;
        Ok(config)
    }
}
