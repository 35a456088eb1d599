//! Warden Lock - Distributed lock coordination
//!
//! This crate provides:
//! - TTL resolution from fixed durations or cron schedules
//! - A quorum lock store over independent storage nodes (Redis or in-memory)
//! - A process-wide lock coordinator with key prefixing and release policy
//! - Execution guards that run a unit of work at most once per lock window

pub mod coordinator;
pub mod duration;
pub mod guard;
pub mod model;
pub mod node;
pub mod quorum;

// Re-export commonly used types
pub use coordinator::{CoordinatorCell, CoordinatorConfig, LockCoordinator};
pub use duration::DurationResolver;
pub use guard::{ExecutionGuard, ExecutionPolicy, Guarded, KeyFn};
pub use model::{DurationSpec, Lock, LockSpec, ReleaseDisposition, ReleaseOutcome};
pub use node::{LockNode, MemoryLockNode, RedisLockNode};
pub use quorum::{QuorumLockStore, QuorumSettings};

pub use warden_common::{LockError, Result};
