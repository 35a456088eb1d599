//! Storage nodes
//!
//! A quorum is built from independent nodes that each offer two atomic
//! primitives: set-if-absent with expiry and delete-if-owned. Any backend
//! implementing [`LockNode`] can take part.

mod memory;
mod redis_node;

pub use memory::MemoryLockNode;
pub use redis_node::{RedisLockNode, normalize_address};

use std::time::Duration;

use async_trait::async_trait;
use warden_common::Result;

/// One independent lock storage node
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Identifier used in logs (usually the address)
    fn id(&self) -> &str;

    /// Store `token` under `key` for `ttl` unless the key already exists.
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `token`.
    ///
    /// Returns `true` when the key was deleted.
    async fn delete_if_owned(&self, key: &str, token: &str) -> Result<bool>;

    /// Drop the connection. Later calls fail with a storage error.
    async fn close(&self) -> Result<()>;
}
