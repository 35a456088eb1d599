//! Redis-compatible lock node.
//!
//! Acquisition uses `SET key token NX PX ttl`; release uses a Lua script so
//! the ownership check and the delete happen atomically on the server.
//!
//! The connection is opened on first use and reused afterwards. A node that
//! cannot be reached fails individual calls instead of the bootstrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use tracing::{debug, info};
use warden_common::{LockError, Result};

use super::LockNode;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Upper bound on a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Reconnect attempts the connection manager makes before giving up
const CONNECT_RETRIES: usize = 1;

/// A single Redis (or KeyDB/Valkey) server taking part in the quorum
pub struct RedisLockNode {
    id: String,
    client: Client,
    conn: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
    release_script: Script,
}

impl RedisLockNode {
    /// Create a node for `address` (`host`, `host:port` or a `redis://` URL).
    ///
    /// Only the address is validated here; no network I/O happens until the
    /// first lock operation.
    pub fn new(address: &str) -> Result<Self> {
        let url = normalize_address(address);
        let client = Client::open(url.as_str()).map_err(|e| LockError::storage(&url, e))?;

        Ok(Self {
            id: url,
            client,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::storage(&self.id, "connection closed"));
        }
        if let Some(conn) = self.conn.lock().clone() {
            return Ok(conn);
        }

        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(CONNECT_TIMEOUT);
        let conn = ConnectionManager::new_with_config(self.client.clone(), config)
            .await
            .map_err(|e| LockError::storage(&self.id, e))?;

        // Concurrent callers may race here; the first stored connection wins
        let mut slot = self.conn.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::storage(&self.id, "connection closed"));
        }
        let conn = slot.get_or_insert(conn).clone();
        info!(node = %self.id, "Connected to lock storage node");
        Ok(conn)
    }
}

#[async_trait]
impl LockNode for RedisLockNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::storage(&self.id, e))?;

        // SET ... NX replies "OK" when the key was set, nil otherwise.
        let acquired = reply.is_some();
        debug!(node = %self.id, %key, acquired, "set_if_absent");
        Ok(acquired)
    }

    async fn delete_if_owned(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::storage(&self.id, e))?;

        debug!(node = %self.id, %key, deleted, "delete_if_owned");
        Ok(deleted == 1)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.conn.lock().take().is_some() {
            debug!(node = %self.id, "Closed lock storage connection");
        }
        Ok(())
    }
}

/// Turn a configured node address into a connection URL.
///
/// Bare `host` or `host:port` values get the `redis://` scheme; URLs are
/// passed through unchanged.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}
