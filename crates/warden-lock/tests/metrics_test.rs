//! Warden Lock Metrics Tests
//!
//! Acquire/release outcome counters observed through a debugging recorder.
//! The recorder is thread-local, so each test drives a current-thread runtime.

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use warden_lock::{CoordinatorConfig, LockCoordinator, LockNode, MemoryLockNode};

fn coordinator(config: CoordinatorConfig) -> (LockCoordinator, Vec<Arc<MemoryLockNode>>) {
    let nodes: Vec<Arc<MemoryLockNode>> = (0..3)
        .map(|i| Arc::new(MemoryLockNode::new(format!("mem-{i}"))))
        .collect();
    let dyn_nodes = nodes
        .iter()
        .map(|node| node.clone() as Arc<dyn LockNode>)
        .collect();
    (LockCoordinator::with_nodes(config, dyn_nodes).unwrap(), nodes)
}

fn counter(snapshotter: &Snapshotter, name: &str, label: (&str, &str)) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, ..)| {
            key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label.0 && l.value() == label.1)
        })
        .map(|(.., value)| match value {
            DebugValue::Counter(n) => n,
            other => panic!("{name} is not a counter: {other:?}"),
        })
        .sum()
}

fn with_recorder(f: impl FnOnce(&Snapshotter, &tokio::runtime::Runtime)) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    metrics::with_local_recorder(&recorder, || f(&snapshotter, &runtime));
}

#[test]
fn test_acquire_outcomes_are_counted() {
    with_recorder(|snapshotter, runtime| {
        let (coordinator, _nodes) = coordinator(CoordinatorConfig::default().with_key_prefix("app"));

        runtime.block_on(async {
            let _held = coordinator.acquire_lock(["report"], None).await.unwrap();
            assert!(coordinator.acquire_lock(["report"], None).await.is_err());
            assert!(coordinator.acquire_lock(["report"], None).await.is_err());
        });

        assert_eq!(counter(snapshotter, "warden_lock_acquire_total", ("outcome", "acquired")), 1);
        assert_eq!(counter(snapshotter, "warden_lock_acquire_total", ("outcome", "failed")), 2);
    });
}

#[test]
fn test_release_dispositions_are_counted() {
    with_recorder(|snapshotter, runtime| {
        let (coordinator, nodes) = coordinator(CoordinatorConfig::default());

        runtime.block_on(async {
            let first = coordinator.acquire_lock(["a"], None).await.unwrap();
            coordinator.release_lock(&first, Some(true)).await;

            let second = coordinator.acquire_lock(["b"], None).await.unwrap();
            coordinator.release_lock(&second, Some(false)).await;

            let third = coordinator.acquire_lock(["c"], None).await.unwrap();
            nodes.iter().for_each(|n| n.set_online(false));
            coordinator.release_lock(&third, Some(true)).await;
        });

        let disposition = |value| counter(snapshotter, "warden_lock_release_total", ("disposition", value));
        assert_eq!(disposition("released"), 1);
        assert_eq!(disposition("retained"), 1);
        assert_eq!(disposition("failed"), 1);
    });
}
