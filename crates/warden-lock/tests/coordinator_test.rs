//! Warden Lock Coordinator Tests
//!
//! End-to-end acquire/release behaviour against in-memory nodes.
//! Time is paused so TTL expiry and retry delays run instantly.

use std::sync::Arc;
use std::time::Duration;

use warden_lock::{
    CoordinatorCell, CoordinatorConfig, DurationSpec, LockCoordinator, LockError, LockNode,
    MemoryLockNode, RedisLockNode, ReleaseDisposition,
};

fn memory_nodes(n: usize) -> Vec<Arc<MemoryLockNode>> {
    (0..n)
        .map(|i| Arc::new(MemoryLockNode::new(format!("mem-{i}"))))
        .collect()
}

fn coordinator(config: CoordinatorConfig, nodes: &[Arc<MemoryLockNode>]) -> LockCoordinator {
    let nodes = nodes
        .iter()
        .map(|node| node.clone() as Arc<dyn LockNode>)
        .collect();
    LockCoordinator::with_nodes(config, nodes).unwrap()
}

fn app_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_key_prefix("app")
        .with_default_ttl_ms(30_000)
        .with_release_after_execution(true)
}

// ============== Acquisition ==============

#[tokio::test(start_paused = true)]
async fn test_second_caller_is_refused_while_held() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config(), &nodes);

    let held = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert_eq!(held.resource(), "app:report");
    assert_eq!(held.ttl_ms(), 30_000);

    let err = coordinator.acquire_lock(["report"], None).await.unwrap_err();
    assert!(matches!(
        err,
        LockError::LockAcquisition { ref resource, attempts: 1 } if resource == "app:report"
    ));
    // The refused attempt must not disturb the holder's entries
    for node in &nodes {
        assert_eq!(node.holder("app:report").as_deref(), Some(held.token()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_counted() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config().with_retry(2, 100, 50), &nodes);

    let _held = coordinator.acquire_lock(["report"], None).await.unwrap();
    let err = coordinator.acquire_lock(["report"], None).await.unwrap_err();
    assert!(matches!(err, LockError::LockAcquisition { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_once_holder_expires() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config().with_retry(5, 200, 0), &nodes);

    let _short = coordinator
        .acquire_lock(["report"], Some(&DurationSpec::Millis(500)))
        .await
        .unwrap();

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert!(lock.attempts() > 1);
    assert_eq!(lock.ttl_ms(), 30_000);
}

#[tokio::test(start_paused = true)]
async fn test_one_node_down_still_reaches_quorum() {
    let nodes = memory_nodes(3);
    nodes[2].set_online(false);
    let coordinator = coordinator(app_config(), &nodes);

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert_eq!(lock.granted_nodes(), &[0, 1]);

    let disposition = coordinator.release_lock(&lock, None).await;
    match disposition {
        ReleaseDisposition::Released(outcome) => {
            assert_eq!(outcome.released, 2);
            assert_eq!(outcome.failed, 1);
            assert!(!outcome.is_total_failure());
        }
        ReleaseDisposition::Retained => panic!("release policy is on"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_minority_write_is_rolled_back() {
    let nodes = memory_nodes(3);
    nodes[1].set_online(false);
    nodes[2].set_online(false);
    let coordinator = coordinator(app_config(), &nodes);

    let err = coordinator.acquire_lock(["report"], None).await.unwrap_err();
    assert!(err.is_acquisition_failure());
    assert!(nodes[0].holder("app:report").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_keys_do_not_contend() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config(), &nodes);

    let a = coordinator.acquire_lock(["sync", "tenant-42"], None).await.unwrap();
    let b = coordinator.acquire_lock(["sync", "tenant-7"], None).await.unwrap();
    assert_eq!(a.resource(), "app:sync:tenant-42");
    assert_eq!(b.resource(), "app:sync:tenant-7");
    assert_ne!(a.token(), b.token());
}

#[tokio::test(start_paused = true)]
async fn test_no_prefix_uses_bare_key() {
    let nodes = memory_nodes(1);
    let coordinator = coordinator(CoordinatorConfig::default(), &nodes);

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert_eq!(lock.resource(), "report");
    // No default configured anywhere: one minute
    assert_eq!(lock.ttl_ms(), 60_000);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_schedule_is_a_configuration_error() {
    let nodes = memory_nodes(1);
    let coordinator = coordinator(app_config(), &nodes);

    let err = coordinator
        .acquire_lock(["report"], Some(&DurationSpec::schedule("not a cron")))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::InvalidSchedule { .. }));
    assert!(nodes[0].is_empty());
}

// ============== Release ==============

#[tokio::test(start_paused = true)]
async fn test_release_frees_key_and_is_idempotent() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config(), &nodes);

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    let first = coordinator.release_lock(&lock, None).await;
    assert!(matches!(first, ReleaseDisposition::Released(o) if o.released == 3));

    let second = coordinator.release_lock(&lock, None).await;
    assert!(matches!(second, ReleaseDisposition::Released(o) if o.not_held == 3 && o.released == 0));

    assert!(coordinator.acquire_lock(["report"], None).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_release_does_not_touch_successor() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config(), &nodes);

    let stale = coordinator
        .acquire_lock(["report"], Some(&DurationSpec::Millis(1_000)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let successor = coordinator.acquire_lock(["report"], None).await.unwrap();

    let disposition = coordinator.release_lock(&stale, None).await;
    assert!(matches!(disposition, ReleaseDisposition::Released(o) if o.released == 0));
    for node in &nodes {
        assert_eq!(node.holder("app:report").as_deref(), Some(successor.token()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_retained_lock_blocks_until_ttl() {
    let nodes = memory_nodes(3);
    let config = CoordinatorConfig::default().with_key_prefix("app");
    let coordinator = coordinator(config, &nodes);

    let lock = coordinator
        .acquire_lock(["report"], Some(&DurationSpec::Millis(1_000)))
        .await
        .unwrap();
    // Nothing configured and no override: keep the lock
    assert_eq!(
        coordinator.release_lock(&lock, None).await,
        ReleaseDisposition::Retained
    );
    assert!(coordinator.acquire_lock(["report"], None).await.is_err());

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert!(coordinator.acquire_lock(["report"], None).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_release_override_beats_config() {
    let nodes = memory_nodes(1);
    let coordinator = coordinator(app_config(), &nodes);

    assert!(coordinator.should_release(None));
    assert!(!coordinator.should_release(Some(false)));

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert_eq!(
        coordinator.release_lock(&lock, Some(false)).await,
        ReleaseDisposition::Retained
    );
    assert!(nodes[0].holder("app:report").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_release_with_every_node_down_is_reported_not_raised() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config(), &nodes);

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    nodes.iter().for_each(|n| n.set_online(false));

    match coordinator.release_lock(&lock, None).await {
        ReleaseDisposition::Released(outcome) => assert!(outcome.is_total_failure()),
        ReleaseDisposition::Retained => panic!("release policy is on"),
    }
}

// ============== Lifecycle ==============

#[tokio::test(start_paused = true)]
async fn test_teardown_is_idempotent_and_fails_fast_afterwards() {
    let nodes = memory_nodes(3);
    let coordinator = coordinator(app_config().with_retry(10, 1_000, 0), &nodes);

    coordinator.teardown().await;
    coordinator.teardown().await;

    assert!(coordinator.store().is_closed());
    assert!(nodes.iter().all(|n| n.is_closed()));

    let started = tokio::time::Instant::now();
    let err = coordinator.acquire_lock(["report"], None).await.unwrap_err();
    assert!(err.is_acquisition_failure());
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

// Nothing listens on these ports, so every connection attempt is refused
const DOWN_NODES: [&str; 3] = ["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"];

#[tokio::test]
async fn test_connect_succeeds_with_unreachable_nodes() {
    let config = CoordinatorConfig::with_nodes(DOWN_NODES.map(String::from).to_vec())
        .with_key_prefix("app");
    let coordinator = LockCoordinator::connect(config).await.unwrap();
    assert_eq!(coordinator.store().nodes().len(), 3);

    let err = coordinator.acquire_lock(["report"], None).await.unwrap_err();
    assert!(matches!(err, LockError::LockAcquisition { attempts: 1, .. }));
    coordinator.teardown().await;
}

#[tokio::test]
async fn test_connect_rejects_malformed_address() {
    let config = CoordinatorConfig::with_nodes(vec![
        "127.0.0.1:1".to_string(),
        "http://cache.internal".to_string(),
    ]);
    let err = LockCoordinator::connect(config).await.err().unwrap();
    assert!(matches!(err, LockError::Storage { .. }));
}

#[tokio::test]
async fn test_unreachable_redis_minority_still_reaches_quorum() {
    let healthy = memory_nodes(2);
    let mut nodes: Vec<Arc<dyn LockNode>> = healthy
        .iter()
        .map(|node| node.clone() as Arc<dyn LockNode>)
        .collect();
    nodes.push(Arc::new(RedisLockNode::new(DOWN_NODES[0]).unwrap()));
    let coordinator = LockCoordinator::with_nodes(app_config(), nodes).unwrap();

    let lock = coordinator.acquire_lock(["report"], None).await.unwrap();
    assert_eq!(lock.granted_nodes(), &[0, 1]);
    assert!(lock.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_cell_keeps_first_coordinator() {
    let cell = CoordinatorCell::new();
    let first_nodes = memory_nodes(1);
    let second_nodes = memory_nodes(1);

    let first = cell
        .install(coordinator(app_config().with_key_prefix("first"), &first_nodes))
        .unwrap();
    let second = cell
        .install(coordinator(app_config().with_key_prefix("second"), &second_nodes))
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.config().key_prefix.as_deref(), Some("first"));
    assert!(cell.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_cell_factory_runs_once() {
    let cell = CoordinatorCell::new();
    let nodes = memory_nodes(1);

    let built = cell
        .get_or_init_with(|| async { Ok(coordinator(app_config(), &nodes)) })
        .await
        .unwrap();
    let again = cell
        .get_or_init_with(|| async { Err(LockError::Config("should not run".to_string())) })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&built, &again));

    cell.shutdown().await;
    assert!(built.store().is_closed());
}

#[tokio::test]
async fn test_cell_factory_error_leaves_cell_empty() {
    let cell = CoordinatorCell::new();
    let err = cell
        .get_or_init_with(|| async { Err(LockError::Config("no nodes".to_string())) })
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LockError::Config(_)));
    assert!(matches!(cell.get(), Err(LockError::UninitializedCoordinator)));
}
