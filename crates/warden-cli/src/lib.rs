//! Warden CLI - run commands under a quorum-backed distributed lock
//!
//! This crate provides:
//! - Layered configuration (file, environment, command line)
//! - Logging and shutdown handling
//! - The `run`, `resolve-ttl` and `probe` subcommands

pub mod command;
pub mod model;
pub mod startup;
