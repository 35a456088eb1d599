//! Warden Common - Shared types and helpers
//!
//! This crate provides the pieces every Warden component agrees on:
//! - The lock error taxonomy
//! - Lock key construction
//! - Default constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{LockError, Result};
pub use utils::{KEY_DELIMITER, join_key};

/// TTL used when neither the caller nor the configuration supplies one (1 minute)
pub const DEFAULT_LOCK_DURATION_MS: u64 = 60_000;

/// Default number of additional acquisition attempts
pub const DEFAULT_RETRY_COUNT: u32 = 0;

/// Default delay between acquisition attempts in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

/// Default upper bound of the random retry jitter in milliseconds
pub const DEFAULT_RETRY_JITTER_MS: u64 = 200;

/// Default clock drift factor applied to the TTL
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;

/// Default upper bound on a single node call during acquisition in milliseconds
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 50;
