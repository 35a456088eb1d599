// In-process lock node
// DashMap-backed stand-in for a storage node with lazy expiry; expired
// entries are swept from the write path at most once per sweep interval

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use warden_common::{LockError, Result};

use super::LockNode;

/// Minimum time between two sweeps of expired entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct TokenEntry {
    token: String,
    expires_at: Instant,
}

impl TokenEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory lock node.
///
/// Useful for tests and single-process deployments. A node can be switched
/// offline to simulate an unreachable storage server.
pub struct MemoryLockNode {
    id: String,
    entries: DashMap<String, TokenEntry>,
    last_sweep: Mutex<Instant>,
    online: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLockNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Take the node offline (`false`) or bring it back (`true`)
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token currently stored under `key`, ignoring expired entries
    pub fn holder(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.token.clone())
    }

    /// Number of unexpired keys
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, expired ones not yet swept included
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(node = %self.id, count = removed, "Cleaned up expired lock entries");
        }
        removed
    }

    fn sweep_if_due(&self) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if last_sweep.elapsed() < SWEEP_INTERVAL {
                return;
            }
            *last_sweep = Instant::now();
        }
        self.purge_expired();
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::storage(&self.id, "connection closed"));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(LockError::storage(&self.id, "node unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl LockNode for MemoryLockNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        // Must run before `entry()` takes its shard lock
        self.sweep_if_due();

        let fresh = TokenEntry {
            token: token.to_string(),
            expires_at: Instant::now() + ttl,
        };
        let acquired = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };

        debug!(node = %self.id, %key, acquired, "set_if_absent");
        Ok(acquired)
    }

    async fn delete_if_owned(&self, key: &str, token: &str) -> Result<bool> {
        self.ensure_available()?;

        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.token == token && !entry.is_expired())
            .is_some();

        debug!(node = %self.id, %key, removed, "delete_if_owned");
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
