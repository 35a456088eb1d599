pub mod config;

pub use config::{AppConfig, Cli, Command, LogRotation, LoggingSettings, RunArgs};
