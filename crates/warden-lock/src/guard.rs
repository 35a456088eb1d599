//! Guarded execution
//!
//! Binds acquire -> execute -> release around a unit of work. The lock key is
//! the policy's static key, optionally followed by a segment derived from the
//! invocation's arguments.
//!
//! Error propagation:
//! - an uninitialized coordinator always surfaces
//! - any other acquisition error, an unresolvable TTL included, surfaces only
//!   when `throw_if_unable_to_acquire` is set; otherwise the execution is
//!   skipped and `Ok(None)` is returned
//! - errors from the unit of work surface unchanged, after the release step
//! - release failures are logged and never surface

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, warn};
use warden_common::LockError;

use crate::coordinator::{CoordinatorCell, LockCoordinator};
use crate::model::DurationSpec;

/// Derives the dynamic key segment from an invocation's arguments
pub type KeyFn<A> = Arc<dyn Fn(&A) -> Option<String> + Send + Sync>;

/// Per-unit-of-work locking policy
pub struct ExecutionPolicy<A> {
    lock_key: String,
    ttl: Option<DurationSpec>,
    throw_if_unable_to_acquire: bool,
    release_after_execution: Option<bool>,
    key_fn: Option<KeyFn<A>>,
}

impl<A> ExecutionPolicy<A> {
    pub fn new(lock_key: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key.into(),
            ttl: None,
            throw_if_unable_to_acquire: false,
            release_after_execution: None,
            key_fn: None,
        }
    }

    /// TTL override for this unit of work (milliseconds or cron expression)
    pub fn ttl(mut self, ttl: impl Into<DurationSpec>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// Return an error instead of skipping when the lock is held elsewhere
    pub fn throw_if_unable_to_acquire(mut self, throw: bool) -> Self {
        self.throw_if_unable_to_acquire = throw;
        self
    }

    /// Override the coordinator's default release policy
    pub fn release_after_execution(mut self, release: bool) -> Self {
        self.release_after_execution = Some(release);
        self
    }

    /// Append a key segment computed from the arguments.
    ///
    /// Returning `None` keeps the static key alone.
    pub fn key_from_args<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn ttl_override(&self) -> Option<&DurationSpec> {
        self.ttl.as_ref()
    }

    pub fn throws_if_unable_to_acquire(&self) -> bool {
        self.throw_if_unable_to_acquire
    }

    pub fn release_override(&self) -> Option<bool> {
        self.release_after_execution
    }

    /// Key segments for one invocation
    pub fn key_segments(&self, args: &A) -> Vec<String> {
        let mut segments = vec![self.lock_key.clone()];
        if let Some(segment) = self.key_fn.as_ref().and_then(|key_fn| key_fn(args)) {
            segments.push(segment);
        }
        segments
    }
}

impl<A> Clone for ExecutionPolicy<A> {
    fn clone(&self) -> Self {
        Self {
            lock_key: self.lock_key.clone(),
            ttl: self.ttl.clone(),
            throw_if_unable_to_acquire: self.throw_if_unable_to_acquire,
            release_after_execution: self.release_after_execution,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<A> fmt::Debug for ExecutionPolicy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPolicy")
            .field("lock_key", &self.lock_key)
            .field("ttl", &self.ttl)
            .field("throw_if_unable_to_acquire", &self.throw_if_unable_to_acquire)
            .field("release_after_execution", &self.release_after_execution)
            .field("dynamic_key", &self.key_fn.is_some())
            .finish()
    }
}

enum CoordinatorHandle {
    Ready(Arc<LockCoordinator>),
    Deferred(Arc<CoordinatorCell>),
}

impl CoordinatorHandle {
    fn resolve(&self) -> Result<Arc<LockCoordinator>, LockError> {
        match self {
            CoordinatorHandle::Ready(coordinator) => Ok(coordinator.clone()),
            CoordinatorHandle::Deferred(cell) => cell.get(),
        }
    }
}

/// Runs units of work under the lock described by its policy
pub struct ExecutionGuard<A> {
    handle: CoordinatorHandle,
    policy: ExecutionPolicy<A>,
}

impl<A> ExecutionGuard<A> {
    pub fn new(coordinator: Arc<LockCoordinator>, policy: ExecutionPolicy<A>) -> Self {
        Self {
            handle: CoordinatorHandle::Ready(coordinator),
            policy,
        }
    }

    /// Guard declared before startup has installed a coordinator.
    ///
    /// The coordinator is looked up on every run; running before the cell is
    /// initialized fails with [`LockError::UninitializedCoordinator`].
    pub fn deferred(cell: Arc<CoordinatorCell>, policy: ExecutionPolicy<A>) -> Self {
        Self {
            handle: CoordinatorHandle::Deferred(cell),
            policy,
        }
    }

    pub fn policy(&self) -> &ExecutionPolicy<A> {
        &self.policy
    }

    /// Run `f(args)` while holding the lock.
    ///
    /// Returns `Ok(None)` when the lock could not be acquired and the policy
    /// says to skip.
    pub async fn run<T, E, F, Fut>(&self, args: A, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let coordinator = self.handle.resolve()?;
        let segments = self.policy.key_segments(&args);
        let lock = match coordinator
            .acquire_lock(segments, self.policy.ttl.as_ref())
            .await
        {
            Ok(lock) => lock,
            Err(e) if self.policy.throw_if_unable_to_acquire => {
                error!(lock_key = %self.policy.lock_key, error = %e, "Unable to acquire lock, failing execution");
                return Err(e.into());
            }
            Err(e) => {
                warn!(lock_key = %self.policy.lock_key, error = %e, "Unable to acquire lock, skipping execution");
                return Ok(None);
            }
        };

        debug!(resource = lock.resource(), attempts = lock.attempts(), "Executing under lock");
        let result = f(args).await;

        coordinator
            .release_lock(&lock, self.policy.release_after_execution)
            .await;

        result.map(Some)
    }

    /// Bind a unit of work to this guard, producing a reusable callable
    pub fn wrap<F>(self, f: F) -> Guarded<A, F> {
        Guarded { guard: self, f }
    }
}

/// A unit of work bound to an [`ExecutionGuard`]
pub struct Guarded<A, F> {
    guard: ExecutionGuard<A>,
    f: F,
}

impl<A, F> Guarded<A, F> {
    pub fn guard(&self) -> &ExecutionGuard<A> {
        &self.guard
    }

    pub async fn call<T, E, Fut>(&self, args: A) -> Result<Option<T>, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.guard.run(args, &self.f).await
    }
}
