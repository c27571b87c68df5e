//! Network partition tests for Raft cluster behavior.
//!
//! These tests verify correct behavior when the network is partitioned:
//! majority elects leader, minority cannot, logs converge after healing.

mod test_harness;

use std::time::Duration;

use shardraft::error::RaftError;
use shardraft::raft::RaftRole;
use test_harness::{TestCluster, TIMEOUT};

/// Splits five nodes so the current leader lands on the minority side.
fn split_with_leader_in_minority(leader_id: u64) -> (Vec<u64>, Vec<u64>) {
    let mut minority = vec![leader_id];
    minority.extend((1..=5).filter(|id| *id != leader_id).take(1));
    let majority = (1..=5).filter(|id| !minority.contains(id)).collect();
    (minority, majority)
}

/// Test 1: Majority partition elects a leader
#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();

    let (minority, majority) = split_with_leader_in_minority(leader_id);
    cluster.create_partition(&minority, &majority);

    let leader = cluster
        .wait_for_leader_in_group(&majority, TIMEOUT)
        .await
        .expect("Majority partition should elect a leader");
    assert!(majority.contains(&leader));
    assert!(cluster.node(leader).current_term() > cluster.node(leader_id).current_term());
}

/// Test 2: Minority partition cannot elect a leader, and pre-vote keeps
/// its terms from climbing
#[tokio::test]
async fn test_minority_partition_cannot_elect_leader() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();

    let mut majority: Vec<u64> = vec![leader_id];
    majority.extend((1..=5).filter(|id| *id != leader_id).take(2));
    let minority: Vec<u64> = (1..=5).filter(|id| !majority.contains(id)).collect();
    let minority_terms: Vec<u64> = minority
        .iter()
        .map(|id| cluster.node(*id).current_term())
        .collect();
    cluster.create_partition(&majority, &minority);

    tokio::time::sleep(Duration::from_millis(600)).await;
    for (id, term) in minority.iter().zip(&minority_terms) {
        let node = cluster.node(*id);
        assert_ne!(node.role(), RaftRole::Leader, "node {id} must not lead");
        assert_eq!(node.current_term(), *term, "node {id} term must not grow");
    }
    assert_eq!(cluster.get_leader_id(), Some(leader_id));
}

/// Test 3: The stranded leader cannot commit; its entry is discarded after heal
#[tokio::test]
async fn test_stranded_leader_entry_discarded() {
    let cluster = TestCluster::new(5).await;
    let old_leader = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let (minority, majority) = split_with_leader_in_minority(old_leader);
    cluster.create_partition(&minority, &majority);

    let handle = cluster.node(old_leader).handle.clone();
    let stranded = tokio::spawn(async move { handle.submit(vec![b"SET lost 1".to_vec()], None).await });

    let new_leader = cluster
        .wait_for_leader_in_group(&majority, TIMEOUT)
        .await
        .expect("Majority should elect a leader");
    let replies = cluster
        .node(new_leader)
        .handle
        .submit(vec![b"SET won 1".to_vec()], None)
        .await
        .expect("Majority commits");
    assert_eq!(replies, vec![b"OK".to_vec()]);

    cluster.heal();
    assert_eq!(stranded.await.unwrap(), Err(RaftError::Discarded));
    assert!(cluster.wait_for_key_on_all("won", "1", TIMEOUT).await);
    assert!(cluster.nodes.values().all(|n| n.kv.get("lost").is_none()));
}

/// Test 4: Logs converge after partition healing
#[tokio::test]
async fn test_partition_healing_logs_converge() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let (minority, majority) = split_with_leader_in_minority(leader_id);
    cluster.create_partition(&minority, &majority);

    let new_leader = cluster
        .wait_for_leader_in_group(&majority, TIMEOUT)
        .await
        .unwrap();
    for i in 0..5 {
        cluster
            .node(new_leader)
            .handle
            .submit(vec![format!("SET p{i} {i}").into_bytes()], None)
            .await
            .unwrap();
    }

    cluster.heal();
    let commit = cluster.node(new_leader).commit_index();
    assert!(cluster.wait_for_applied_on_all(commit, TIMEOUT).await);
    for node in cluster.nodes.values() {
        assert_eq!(node.kv.get("p4").as_deref(), Some("4"), "node {}", node.node_id);
    }
}

/// Test 5: Split brain prevention - exactly one leader after partition heals
#[tokio::test]
async fn test_split_brain_prevention() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let (minority, majority) = split_with_leader_in_minority(leader_id);
    cluster.create_partition(&minority, &majority);
    cluster
        .wait_for_leader_in_group(&majority, TIMEOUT)
        .await
        .unwrap();

    cluster.heal();
    test_harness::assert_eventually(
        || async { cluster.count_leaders() == 1 },
        TIMEOUT,
        "Exactly one leader should remain after healing",
    )
    .await;
    let leader = cluster.get_leader_id().unwrap();
    assert!(majority.contains(&leader));
}

/// Test 6: Isolated node rejoins cluster and catches up
#[tokio::test]
async fn test_isolated_node_rejoins_cluster() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster.wait_for_leader(TIMEOUT).await.unwrap();
    let isolated = (1..=3).find(|id| *id != leader_id).unwrap();
    cluster.isolate_node(isolated);

    for i in 0..10 {
        cluster
            .submit(&[format!("SET iso{i} {i}").as_str()])
            .await
            .unwrap();
    }
    assert_eq!(cluster.node(isolated).kv.get("iso9"), None);

    cluster.heal();
    assert!(cluster.wait_for_key_on_all("iso9", "9", TIMEOUT).await);
    assert_eq!(cluster.get_leader_id(), Some(leader_id), "Rejoining must not depose the leader");
}
