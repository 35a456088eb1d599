//! Quorum lock protocol
//!
//! Provides:
//! - Majority acquisition across N independent nodes with clock drift
//!   compensation
//! - Rollback of partial acquisitions and jittered retries
//! - Best-effort release on every node

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;
use warden_common::{
    DEFAULT_DRIFT_FACTOR, DEFAULT_NODE_TIMEOUT_MS, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_RETRY_JITTER_MS, LockError, Result,
};

use crate::model::{Lock, ReleaseOutcome};
use crate::node::LockNode;

/// Fixed overhead added to the drift estimate (network round trip slack)
const DRIFT_OVERHEAD: Duration = Duration::from_millis(2);

/// Lower bound for how long a release waits on a single node
const RELEASE_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);

/// Smallest per-node budget during acquisition, whatever the TTL
const NODE_TIMEOUT_FLOOR: Duration = Duration::from_millis(5);

/// Retry and drift settings for the quorum protocol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumSettings {
    /// Additional attempts after the first one
    pub retry_count: u32,
    /// Base wait between attempts
    pub retry_delay: Duration,
    /// The wait is randomized by up to this much in either direction
    pub retry_jitter: Duration,
    /// Fraction of the TTL assumed lost to clock drift
    pub drift_factor: f64,
    /// Longest wait on a single node while acquiring or rolling back.
    ///
    /// Capped at a tenth of the TTL so a slow node cannot eat the validity
    /// window of the nodes that answered.
    pub node_timeout: Duration,
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_jitter: Duration::from_millis(DEFAULT_RETRY_JITTER_MS),
            drift_factor: DEFAULT_DRIFT_FACTOR,
            node_timeout: Duration::from_millis(DEFAULT_NODE_TIMEOUT_MS),
        }
    }
}

/// Mutual exclusion over a set of independent storage nodes
pub struct QuorumLockStore {
    nodes: Vec<Arc<dyn LockNode>>,
    settings: QuorumSettings,
    closed: AtomicBool,
}

impl QuorumLockStore {
    pub fn new(nodes: Vec<Arc<dyn LockNode>>, settings: QuorumSettings) -> Result<Self> {
        if nodes.is_empty() {
            return Err(LockError::Config(
                "at least one lock storage node is required".to_string(),
            ));
        }
        Ok(Self {
            nodes,
            settings,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of nodes that must agree: `N/2 + 1`
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn nodes(&self) -> &[Arc<dyn LockNode>] {
        &self.nodes
    }

    pub fn settings(&self) -> &QuorumSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Acquire `resource` on a majority of nodes for `ttl_ms`.
    ///
    /// Makes up to `retry_count + 1` attempts and fails with
    /// [`LockError::LockAcquisition`] once they are exhausted.
    pub async fn acquire(&self, resource: &str, ttl_ms: u64) -> Result<Lock> {
        let ttl = Duration::from_millis(ttl_ms);
        let max_attempts = self.settings.retry_count.saturating_add(1);
        let mut attempts = 0;

        while attempts < max_attempts {
            if self.is_closed() {
                debug!(%resource, attempts, "Lock store closed, abandoning acquisition");
                break;
            }
            attempts += 1;

            if let Some(lock) = self.attempt(resource, ttl, attempts).await {
                debug!(%resource, attempts, ttl_ms, "Lock acquired on quorum");
                return Ok(lock);
            }

            if attempts < max_attempts {
                sleep(self.retry_delay()).await;
            }
        }

        Err(LockError::LockAcquisition {
            resource: resource.to_string(),
            attempts,
        })
    }

    async fn attempt(&self, resource: &str, ttl: Duration, attempt: u32) -> Option<Lock> {
        let token = Uuid::new_v4().simple().to_string();
        let node_timeout = self.node_timeout(ttl);
        let start = Instant::now();

        let votes = join_all(self.nodes.iter().map(|node| {
            let token = token.as_str();
            async move { timeout(node_timeout, node.set_if_absent(resource, token, ttl)).await }
        }))
        .await;

        let mut granted = Vec::with_capacity(votes.len());
        for (index, vote) in votes.into_iter().enumerate() {
            match vote {
                Ok(Ok(true)) => granted.push(index),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(%resource, error = %e, "Lock node rejected acquisition"),
                Err(_) => warn!(
                    %resource,
                    node = self.nodes[index].id(),
                    "Lock node timed out during acquisition"
                ),
            }
        }

        let drift = self.drift(ttl);
        let validity = ttl.checked_sub(start.elapsed() + drift);
        let quorum_reached = granted.len() >= self.quorum();

        if quorum_reached && validity.is_some_and(|window| !window.is_zero()) {
            let deadline = start + (ttl - drift);
            let ttl_ms = ttl.as_millis() as u64;
            return Some(Lock::new(
                resource.to_string(),
                token,
                ttl_ms,
                deadline,
                attempt,
                granted,
            ));
        }

        debug!(
            %resource,
            attempt,
            granted = granted.len(),
            quorum = self.quorum(),
            "Quorum not reached within validity window"
        );
        self.rollback(resource, &token, node_timeout).await;
        None
    }

    /// Delete `token` from every node, not only the ones that granted: a node
    /// that timed out may still have stored it.
    async fn rollback(&self, resource: &str, token: &str, node_timeout: Duration) {
        let results = join_all(self.nodes.iter().map(|node| async move {
            timeout(node_timeout, node.delete_if_owned(resource, token)).await
        }))
        .await;

        for (node, result) in self.nodes.iter().zip(results) {
            let reason = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            debug!(
                %resource,
                node = node.id(),
                %reason,
                "Rollback of partial acquisition failed, entry will expire"
            );
        }
    }

    /// Release `lock` on every node.
    ///
    /// Nodes that never held the token answer "not held"; unreachable nodes
    /// are counted as failed. Never returns an error.
    pub async fn release(&self, lock: &Lock) -> ReleaseOutcome {
        let wait = self.settings.node_timeout.max(RELEASE_TIMEOUT_FLOOR);
        let results = join_all(self.nodes.iter().map(|node| async move {
            timeout(wait, node.delete_if_owned(lock.resource(), lock.token())).await
        }))
        .await;

        let mut outcome = ReleaseOutcome::default();
        for (node, result) in self.nodes.iter().zip(results) {
            match result {
                Ok(Ok(true)) => outcome.released += 1,
                Ok(Ok(false)) => outcome.not_held += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    debug!(resource = lock.resource(), error = %e, "Lock release failed on node");
                }
                Err(_) => {
                    outcome.failed += 1;
                    debug!(
                        resource = lock.resource(),
                        node = node.id(),
                        "Lock release timed out on node"
                    );
                }
            }
        }
        outcome
    }

    /// Close every node connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let results = join_all(self.nodes.iter().map(|node| node.close())).await;
        for (node, result) in self.nodes.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = node.id(), error = %e, "Failed to close lock storage node");
            }
        }
    }

    fn node_timeout(&self, ttl: Duration) -> Duration {
        self.settings
            .node_timeout
            .min(ttl / 10)
            .max(NODE_TIMEOUT_FLOOR)
    }

    fn drift(&self, ttl: Duration) -> Duration {
        let estimate = (ttl.as_millis() as f64 * self.settings.drift_factor).round();
        Duration::from_millis(estimate.max(0.0) as u64) + DRIFT_OVERHEAD
    }

    fn retry_delay(&self) -> Duration {
        let base = self.settings.retry_delay.as_millis() as f64;
        let jitter = self.settings.retry_jitter.as_millis() as f64;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * jitter;
        Duration::from_millis((base + offset).max(0.0) as u64)
    }
}
