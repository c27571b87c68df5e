//! Integration tests for Raft log compaction.
//!
//! Verifies that:
//! - Log compaction triggers when the applied log exceeds the threshold
//! - Slow followers catch up via a chunked snapshot
//! - State is restored from snapshot and log after a restart

mod test_harness;

use std::time::Duration;

use shardraft::error::RaftError;
use shardraft::raft::snapshot::SnapshotError;
use test_harness::{persistent_config, test_node_config, TestCluster, TIMEOUT};

/// Test that log compaction triggers once enough entries were applied.
#[tokio::test]
async fn test_log_compaction_triggered() {
    let configs = (1..=3)
        .map(|id| {
            let mut config = test_node_config(id);
            config.snapshot_threshold = 20;
            config
        })
        .collect();
    let cluster = TestCluster::with_configs(configs).await;

    for i in 0..40 {
        cluster
            .submit(&[format!("SET k{i} {i}").as_str()])
            .await
            .unwrap();
    }

    test_harness::assert_eventually(
        || async {
            cluster.nodes.values().all(|n| {
                let info = n.info();
                info.snapshot_last_index >= 20 && info.first_log_index > 1
            })
        },
        TIMEOUT,
        "Every node should have compacted its log",
    )
    .await;
    for node in cluster.nodes.values() {
        assert_eq!(node.kv.get("k39").as_deref(), Some("39"));
    }
}

/// Test that a manual compaction reports the snapshot index and drops the prefix.
#[tokio::test]
async fn test_debug_compact() {
    let cluster = TestCluster::new(1).await;
    cluster.submit(&["SET a 1", "SET b 2"]).await.unwrap();
    let applied = cluster.node(1).last_applied();

    let index = cluster
        .node(1)
        .handle
        .debug_compact(Duration::ZERO)
        .await
        .expect("Compaction should succeed");

    assert_eq!(index, applied);
    let info = cluster.node(1).info();
    assert_eq!(info.snapshot_last_index, applied);
    assert_eq!(info.first_log_index, applied + 1);
    assert!(!info.snapshot_in_progress);
}

/// Test that a second snapshot cannot start while one is still being written.
#[tokio::test]
async fn test_snapshot_in_progress_rejected() {
    let cluster = TestCluster::new(1).await;
    cluster.submit(&["SET a 1"]).await.unwrap();
    let handle = cluster.node(1).handle.clone();

    let slow = tokio::spawn({
        let handle = handle.clone();
        async move { handle.debug_compact(Duration::from_millis(300)).await }
    });
    test_harness::assert_eventually(
        || async { cluster.node(1).info().snapshot_in_progress },
        TIMEOUT,
        "Snapshot should be in progress",
    )
    .await;

    assert_eq!(
        handle.debug_compact(Duration::ZERO).await,
        Err(RaftError::Snapshot(SnapshotError::InProgress))
    );
    // Writes keep flowing while the snapshot is written.
    cluster.submit(&["SET b 2"]).await.unwrap();

    let index = slow.await.unwrap().expect("Delayed compaction completes");
    assert!(cluster.node(1).info().snapshot_last_index >= index);
}

/// Test that a slow follower catches up via snapshot after being isolated
/// during a compaction event.
#[tokio::test]
async fn test_snapshot_sent_to_slow_follower() {
    let configs = (1..=3)
        .map(|id| {
            let mut config = test_node_config(id);
            // Several chunks per snapshot.
            config.snapshot_chunk_size = 128;
            config
        })
        .collect();
    let cluster = TestCluster::with_configs(configs).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let slow = (1..=3).find(|id| *id != leader_id).unwrap();

    cluster.isolate_node(slow);
    for i in 0..30 {
        cluster
            .submit(&[format!("SET slow{i} value-{i}").as_str()])
            .await
            .unwrap();
    }
    let index = cluster
        .node(leader_id)
        .handle
        .debug_compact(Duration::ZERO)
        .await
        .unwrap();
    assert!(cluster.node(leader_id).info().first_log_index > cluster.node(slow).info().last_log_index);

    cluster.heal();
    test_harness::assert_eventually(
        || async { cluster.node(slow).info().snapshot_last_index >= index },
        TIMEOUT,
        "Slow follower should install the leader's snapshot",
    )
    .await;
    assert!(cluster.wait_for_key_on_all("slow29", "value-29", TIMEOUT).await);
}

/// Test that a forced snapshot send reaches a lagging follower.
#[tokio::test]
async fn test_debug_send_snapshot() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let follower = (1..=3).find(|id| *id != leader_id).unwrap();
    let handle = cluster.node(leader_id).handle.clone();

    // Nothing to send before the first snapshot.
    assert!(handle.debug_send_snapshot(follower).await.is_err());

    cluster.isolate_node(follower);
    cluster.submit(&["SET pushed 1"]).await.unwrap();
    let index = handle.debug_compact(Duration::ZERO).await.unwrap();
    assert_eq!(
        handle.debug_send_snapshot(99).await,
        Err(RaftError::UnknownNode(99))
    );
    handle.debug_send_snapshot(follower).await.unwrap();
    cluster.heal();

    test_harness::assert_eventually(
        || async { cluster.node(follower).info().snapshot_last_index >= index },
        TIMEOUT,
        "Follower should receive the forced snapshot",
    )
    .await;
    cluster.submit(&["SET after push"]).await.unwrap();
    assert!(cluster.wait_for_key_on_all("after", "push", TIMEOUT).await);
}

/// Test that a node restores its snapshot and log suffix after a restart.
#[tokio::test]
async fn test_restart_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::with_configs(vec![persistent_config(1, dir.path())]).await;
    cluster.submit(&["SET before snapshot"]).await.unwrap();
    cluster
        .node(1)
        .handle
        .debug_compact(Duration::ZERO)
        .await
        .unwrap();
    cluster.submit(&["SET after snapshot"]).await.unwrap();
    let info = cluster.node(1).info();

    let config = cluster.stop_node(1).await.unwrap();
    cluster.start_node(config);
    let restored = cluster
        .node(1)
        .handle
        .wait_for(TIMEOUT, |i| i.is_leader())
        .await
        .expect("Single node should lead again");

    assert_eq!(restored.dbid, info.dbid);
    assert!(restored.term >= info.term);
    assert_eq!(restored.snapshot_last_index, info.snapshot_last_index);
    assert!(restored.commit_index >= info.commit_index);
    assert_eq!(cluster.node(1).kv.get("before").as_deref(), Some("snapshot"));
    assert_eq!(cluster.node(1).kv.get("after").as_deref(), Some("snapshot"));

    cluster.submit(&["SET restarted yes"]).await.unwrap();
}

/// Test that a new node joining after compaction is seeded from the snapshot.
#[tokio::test]
async fn test_new_node_bootstraps_from_snapshot() {
    let mut cluster = TestCluster::new(2).await;
    for i in 0..10 {
        cluster
            .submit(&[format!("SET seed{i} {i}").as_str()])
            .await
            .unwrap();
    }
    let leader_id = cluster.get_leader_id().unwrap();
    let index = cluster
        .node(leader_id)
        .handle
        .debug_compact(Duration::ZERO)
        .await
        .unwrap();

    cluster.add_node(test_node_config(3)).await;
    cluster.wait_for_voter(3, TIMEOUT).await.expect("Node 3 promoted");

    assert!(cluster.node(3).info().snapshot_last_index >= index);
    assert!(cluster.wait_for_key_on_all("seed9", "9", TIMEOUT).await);
}
