//! Lock coordinator
//!
//! The coordinator owns the quorum store and applies the process-wide policy:
//! key prefixing, TTL defaults, retry settings and the default release
//! behaviour. Startup code builds exactly one coordinator and hands it to
//! every guard; [`CoordinatorCell`] gives that bootstrap first-writer-wins
//! semantics.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use warden_common::{
    DEFAULT_DRIFT_FACTOR, DEFAULT_NODE_TIMEOUT_MS, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_RETRY_JITTER_MS, LockError, Result,
};

use crate::duration::DurationResolver;
use crate::model::{DurationSpec, Lock, LockSpec, ReleaseDisposition};
use crate::node::{LockNode, RedisLockNode};
use crate::quorum::{QuorumLockStore, QuorumSettings};

/// Process-wide lock configuration, fixed once the coordinator is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Storage node addresses (`host`, `host:port` or `redis://` URLs)
    pub nodes: Vec<String>,
    /// Prepended to every lock key
    pub key_prefix: Option<String>,
    /// TTL used when a lock request does not carry one
    pub default_ttl_ms: Option<u64>,
    /// Additional acquisition attempts after the first one
    pub retry_count: u32,
    /// Wait between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum random deviation from `retry_delay_ms`
    pub retry_jitter_ms: u64,
    /// Fraction of the TTL reserved for clock drift
    pub drift_factor: f64,
    /// Longest wait on a single node per acquisition attempt, in milliseconds
    pub node_timeout_ms: u64,
    /// Release locks after execution unless the caller says otherwise
    pub release_after_execution: Option<bool>,
    /// Milliseconds removed from TTLs derived from a cron schedule
    pub lock_duration_delta_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1:6379".to_string()],
            key_prefix: None,
            default_ttl_ms: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            release_after_execution: None,
            lock_duration_delta_ms: 0,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config for a single storage node
    pub fn new(node: &str) -> Self {
        Self {
            nodes: vec![node.to_string()],
            ..Default::default()
        }
    }

    /// Create a config for several storage nodes
    pub fn with_nodes(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = Some(ttl_ms);
        self
    }

    /// Set retry count, delay and jitter (milliseconds)
    pub fn with_retry(mut self, count: u32, delay_ms: u64, jitter_ms: u64) -> Self {
        self.retry_count = count;
        self.retry_delay_ms = delay_ms;
        self.retry_jitter_ms = jitter_ms;
        self
    }

    pub fn with_drift_factor(mut self, drift_factor: f64) -> Self {
        self.drift_factor = drift_factor;
        self
    }

    pub fn with_node_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.node_timeout_ms = timeout_ms;
        self
    }

    pub fn with_release_after_execution(mut self, release: bool) -> Self {
        self.release_after_execution = Some(release);
        self
    }

    pub fn with_lock_duration_delta_ms(mut self, delta_ms: u64) -> Self {
        self.lock_duration_delta_ms = delta_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LockError::Config(
                "at least one lock storage node is required".to_string(),
            ));
        }
        if self.nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(LockError::Config(
                "lock storage node address must not be blank".to_string(),
            ));
        }
        self.validate_drift()
    }

    fn validate_drift(&self) -> Result<()> {
        if !self.drift_factor.is_finite() || !(0.0..1.0).contains(&self.drift_factor) {
            return Err(LockError::Config(format!(
                "drift factor must be in [0, 1), got {}",
                self.drift_factor
            )));
        }
        Ok(())
    }

    pub fn quorum_settings(&self) -> QuorumSettings {
        QuorumSettings {
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            retry_jitter: Duration::from_millis(self.retry_jitter_ms),
            drift_factor: self.drift_factor,
            node_timeout: Duration::from_millis(self.node_timeout_ms),
        }
    }

    pub fn duration_resolver(&self) -> DurationResolver {
        DurationResolver::new(self.default_ttl_ms).with_delta(self.lock_duration_delta_ms)
    }
}

/// Acquires and releases prefixed locks on the quorum store
pub struct LockCoordinator {
    config: CoordinatorConfig,
    resolver: DurationResolver,
    store: QuorumLockStore,
}

impl LockCoordinator {
    /// Build the coordinator over the configured Redis nodes.
    ///
    /// Node connections are opened on first use, so nodes that are down at
    /// startup only count against the quorum of each acquisition.
    pub async fn connect(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        let nodes = config
            .nodes
            .iter()
            .map(|address| RedisLockNode::new(address).map(|node| Arc::new(node) as Arc<dyn LockNode>))
            .collect::<Result<Vec<_>>>()?;

        info!(
            nodes = nodes.len(),
            key_prefix = config.key_prefix.as_deref().unwrap_or(""),
            retry_count = config.retry_count,
            "Lock coordinator configured"
        );

        let store = QuorumLockStore::new(nodes, config.quorum_settings())?;
        Ok(Self::new(config, store))
    }

    /// Build a coordinator over caller supplied nodes (memory nodes in tests,
    /// custom backends elsewhere). `config.nodes` is not consulted.
    pub fn with_nodes(config: CoordinatorConfig, nodes: Vec<Arc<dyn LockNode>>) -> Result<Self> {
        config.validate_drift()?;
        let store = QuorumLockStore::new(nodes, config.quorum_settings())?;
        Ok(Self::new(config, store))
    }

    pub fn new(config: CoordinatorConfig, store: QuorumLockStore) -> Self {
        let resolver = config.duration_resolver();
        Self {
            config,
            resolver,
            store,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &QuorumLockStore {
        &self.store
    }

    /// Build the lock spec for `segments`, applying the configured prefix
    pub fn lock_spec<I, S>(&self, segments: I, duration: Option<&DurationSpec>) -> LockSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LockSpec::new(
            self.config.key_prefix.as_deref(),
            segments.into_iter().map(Into::into).collect(),
            duration.cloned(),
        )
    }

    /// TTL for `duration`, falling back to the configured default
    pub fn lock_duration(&self, duration: Option<&DurationSpec>) -> Result<u64> {
        self.resolver.resolve(duration)
    }

    /// Acquire the lock named by `segments` (prefixed with the key prefix).
    pub async fn acquire_lock<I, S>(&self, segments: I, duration: Option<&DurationSpec>) -> Result<Lock>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.lock_spec(segments, duration);
        let ttl_ms = self.lock_duration(spec.duration())?;

        match self.store.acquire(spec.resource(), ttl_ms).await {
            Ok(lock) => {
                metrics::counter!("warden_lock_acquire_total", "outcome" => "acquired").increment(1);
                Ok(lock)
            }
            Err(e) => {
                metrics::counter!("warden_lock_acquire_total", "outcome" => "failed").increment(1);
                debug!(resource = spec.resource(), error = %e, "Lock acquisition failed");
                Err(e)
            }
        }
    }

    /// Effective release policy: override, then configured default, then `false`
    pub fn should_release(&self, release_override: Option<bool>) -> bool {
        release_override
            .or(self.config.release_after_execution)
            .unwrap_or(false)
    }

    /// Release `lock` if the effective policy says so.
    ///
    /// With the policy off the lock is left to expire at its TTL. Release
    /// failures are reported in the returned outcome, never as an error.
    pub async fn release_lock(&self, lock: &Lock, release_override: Option<bool>) -> ReleaseDisposition {
        if !self.should_release(release_override) {
            metrics::counter!("warden_lock_release_total", "disposition" => "retained").increment(1);
            debug!(resource = lock.resource(), ttl_ms = lock.ttl_ms(), "Lock retained until TTL expiry");
            return ReleaseDisposition::Retained;
        }

        let outcome = self.store.release(lock).await;
        if outcome.is_total_failure() {
            metrics::counter!("warden_lock_release_total", "disposition" => "failed").increment(1);
            warn!(
                resource = lock.resource(),
                nodes = outcome.nodes(),
                "Lock release failed on every node, it will expire at its TTL"
            );
        } else {
            metrics::counter!("warden_lock_release_total", "disposition" => "released").increment(1);
        }
        ReleaseDisposition::Released(outcome)
    }

    /// Close all storage connections. Outstanding locks expire via TTL.
    pub async fn teardown(&self) {
        if self.store.is_closed() {
            return;
        }
        self.store.close().await;
        info!("Lock coordinator torn down");
    }
}

/// Holds the single coordinator built at startup.
///
/// The first successful initialization wins; later attempts keep the
/// existing instance.
#[derive(Default)]
pub struct CoordinatorCell {
    inner: OnceCell<Arc<LockCoordinator>>,
}

impl CoordinatorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an already built coordinator
    pub fn install(&self, coordinator: LockCoordinator) -> Result<Arc<LockCoordinator>> {
        if self.inner.set(Arc::new(coordinator)).is_err() {
            debug!("Lock coordinator already initialized, keeping the existing instance");
        }
        self.get()
    }

    /// Initialize from an async factory (e.g. one that loads configuration
    /// first). The factory only runs if nothing is installed yet.
    pub async fn get_or_init_with<F, Fut>(&self, factory: F) -> Result<Arc<LockCoordinator>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LockCoordinator>>,
    {
        self.inner
            .get_or_try_init(|| async move { factory().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Build a coordinator over the configured Redis nodes unless already initialized
    pub async fn connect(&self, config: CoordinatorConfig) -> Result<Arc<LockCoordinator>> {
        self.get_or_init_with(|| LockCoordinator::connect(config)).await
    }

    pub fn get(&self) -> Result<Arc<LockCoordinator>> {
        self.inner
            .get()
            .cloned()
            .ok_or(LockError::UninitializedCoordinator)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }

    /// Tear down the installed coordinator, if any
    pub async fn shutdown(&self) {
        if let Some(coordinator) = self.inner.get() {
            coordinator.teardown().await;
        }
    }
}
