//! Safety properties of the consensus core under a deterministic simulation.
//!
//! No tokio here: every test drives [`RaftCore`]s tick by tick through
//! [`sim_harness::Sim`], which also asserts after each tick that no term
//! ever has two leaders.

mod sim_harness;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shardraft::raft::core::{ApplyOutcome, RaftEvent};
use shardraft::raft::{NodeRole, RaftRole};
use shardraft::RaftError;
use sim_harness::{sim_addr, sim_timing, Sim};

/// A fresh group elects exactly one leader
#[test]
fn test_single_leader_elected() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();

    let leaders = sim
        .nodes
        .values()
        .filter(|n| n.core.role() == RaftRole::Leader)
        .count();
    assert_eq!(leaders, 1);

    // Followers learn who leads from the first heartbeat.
    sim.run(5);
    for node in sim.nodes.values() {
        assert_eq!(node.core.leader_id(), Some(leader));
    }
}

/// Committed entries are applied in order on every node
#[test]
fn test_replication_applies_everywhere() {
    let mut sim = Sim::new(3);
    sim.elect();

    sim.propose(&["SET a 1"]);
    sim.propose(&["SET b 2", "SET a 3"]);
    let (index, _) = sim.propose(&["DEL b"]);

    assert!(sim.wait_applied(&[1, 2, 3], index));
    for node in sim.nodes.values() {
        assert_eq!(node.kv.get("a").as_deref(), Some("3"));
        assert_eq!(node.kv.get("b"), None);
    }
    sim.assert_committed_prefixes_match();
}

/// The leader reports one reply per op, in submission order
#[test]
fn test_applied_event_carries_replies_in_order() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();

    let (index, term) = sim.propose(&["SET k v", "GET k", "DEL k", "GET k"]);
    assert!(sim.wait_applied(&[leader], index));

    let outcome = sim.nodes[&leader]
        .events
        .iter()
        .find_map(|e| match e {
            RaftEvent::Applied {
                index: i,
                term: t,
                outcome,
            } if *i == index && *t == term => Some(outcome.clone()),
            _ => None,
        })
        .expect("applied event for the proposal");
    let expected: Vec<Vec<u8>> = ["OK", "v", "1", "(nil)"]
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();
    assert_eq!(outcome, ApplyOutcome::Command(expected));
}

/// A new leader is elected in a higher term after the leader crashes
#[test]
fn test_failover_elects_new_leader() {
    let mut sim = Sim::new(3);
    let old = sim.elect();
    let old_term = sim.core(old).state().current_term;
    let (index, _) = sim.propose(&["SET before crash"]);
    let survivors: Vec<u64> = (1..=3).filter(|id| *id != old).collect();
    assert!(sim.wait_applied(&survivors, index));

    sim.crash(old);
    let new = sim.elect();
    assert_ne!(new, old);
    assert!(sim.core(new).state().current_term > old_term);

    // Leader completeness: the committed entry survived the change.
    assert_eq!(
        sim.nodes[&new].kv.get("before").as_deref(),
        Some("crash")
    );
    let (index, _) = sim.propose(&["SET after crash"]);
    assert!(sim.wait_applied(&survivors, index));
}

/// An isolated follower keeps its term thanks to pre-vote and cannot
/// depose the leader when it comes back
#[test]
fn test_pre_vote_prevents_disruption() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    let term = sim.core(leader).state().current_term;
    let follower = (1..=3).find(|id| *id != leader).expect("a follower");

    sim.isolate(follower);
    sim.run(200);
    assert_eq!(
        sim.core(follower).state().current_term,
        term,
        "pre-vote must not bump the term"
    );
    assert_ne!(sim.core(follower).role(), RaftRole::Leader);

    sim.heal();
    sim.run(50);
    assert_eq!(sim.leader(), Some(leader));
    assert_eq!(sim.core(leader).state().current_term, term);
}

/// A minority cannot commit; the majority side elects and commits
#[test]
fn test_partition_minority_cannot_commit() {
    let mut sim = Sim::new(5);
    let old = sim.elect();
    let minority: Vec<u64> = vec![old, (1..=5).find(|id| *id != old).expect("peer")];
    let majority: Vec<u64> = (1..=5).filter(|id| !minority.contains(id)).collect();
    sim.partition(&minority, &majority);

    // The stranded leader still accepts writes but never commits them.
    let batch = shardraft::CommandBatch::new(vec![b"SET lost 1".to_vec()]);
    let (stale_index, stale_term) = sim
        .core_mut(old)
        .propose_command(&batch, 0)
        .expect("old leader still leads locally");
    sim.run(100);
    assert!(sim.commit_index(old) < stale_index);

    let new = sim
        .run_until(500, |sim| {
            majority
                .iter()
                .any(|id| sim.core(*id).role() == RaftRole::Leader)
        })
        .then(|| sim.leader())
        .flatten()
        .expect("majority elects a leader");
    assert!(majority.contains(&new));
    let (index, _) = sim.propose(&["SET won 1"]);
    assert!(sim.wait_applied(&majority, index));

    sim.heal();
    assert!(sim.wait_applied(&[1, 2, 3, 4, 5], index));
    assert_ne!(sim.core(old).role(), RaftRole::Leader);
    // The uncommitted entry from the old term was overwritten.
    assert_ne!(sim.core(old).log().term_at(stale_index), Some(stale_term));
    for node in sim.nodes.values() {
        assert_eq!(node.kv.get("lost"), None);
        assert_eq!(node.kv.get("won").as_deref(), Some("1"));
    }
    sim.assert_committed_prefixes_match();
}

/// Random partitions and crashes never break log matching on committed entries
#[test]
fn test_random_partitions_keep_logs_consistent() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut sim = Sim::new(5);
    sim.elect();

    for round in 0..30 {
        if rng.gen_bool(0.3) {
            let a: u64 = rng.gen_range(1..=5);
            let b: u64 = rng.gen_range(1..=5);
            if a != b {
                sim.block(a, b);
            }
        }
        if round % 7 == 0 {
            sim.heal();
        }
        if sim.leader().is_some() {
            let op = format!("SET k{round} {round}");
            let _ = sim.propose(&[op.as_str()]);
        }
        sim.run(rng.gen_range(1..30));
        sim.assert_committed_prefixes_match();
    }

    sim.heal();
    sim.elect();
    let (index, _) = sim.propose(&["SET final 1"]);
    assert!(sim.wait_applied(&[1, 2, 3, 4, 5], index));
    sim.assert_committed_prefixes_match();
}

/// A leader hands over to a caught-up voter via TimeoutNow
#[test]
fn test_leadership_transfer_in_simulation() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    let target = (1..=3).find(|id| *id != leader).expect("a follower");
    let term = sim.core(leader).state().current_term;

    sim.core_mut(leader)
        .transfer_leadership(target)
        .expect("transfer starts");
    assert!(sim.run_until(100, |sim| sim.leader() == Some(target)));
    assert!(sim.core(target).state().current_term > term);

    // The old leader learns the outcome.
    sim.run(5);
    let finished = sim.nodes[&leader].events.iter().any(|e| {
        matches!(e, RaftEvent::TransferFinished(Ok(id)) if *id == target)
    });
    assert!(finished, "old leader should report the completed transfer");
}

/// Transfers to self or to non-members are refused up front
#[test]
fn test_transfer_rejections() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();

    assert_eq!(
        sim.core_mut(leader).transfer_leadership(leader),
        Err(RaftError::TransferToSelf)
    );
    assert_eq!(
        sim.core_mut(leader).transfer_leadership(9),
        Err(RaftError::UnknownNode(9))
    );
    let follower = (1..=3).find(|id| *id != leader).expect("a follower");
    assert!(matches!(
        sim.core_mut(follower).transfer_leadership(leader),
        Err(RaftError::NotLeader { .. })
    ));
}

/// A transfer to an unreachable voter times out and leaves the leader in place
#[test]
fn test_transfer_to_unreachable_node_times_out() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    let target = (1..=3).find(|id| *id != leader).expect("a follower");
    sim.isolate(target);
    let _ = sim.propose(&["SET x 1"]);

    sim.core_mut(leader)
        .transfer_leadership(target)
        .expect("transfer starts");
    sim.run(sim_timing().transfer_timeout_ticks as usize + 5);

    let timed_out = sim.nodes[&leader]
        .events
        .iter()
        .any(|e| matches!(e, RaftEvent::TransferFinished(Err(RaftError::Timeout))));
    assert!(timed_out);
    assert_eq!(sim.leader(), Some(leader));
}

/// A new node is added as non-voting, then promoted once caught up
#[test]
fn test_add_node_promotes_after_catch_up() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    for i in 0..10 {
        sim.propose(&[format!("SET k{i} {i}").as_str()]);
    }

    sim.spawn_empty(4);
    let (_, _, id) = sim
        .core_mut(leader)
        .add_node(4, &sim_addr(4))
        .expect("add accepted");
    assert_eq!(id, 4);

    let promoted = sim.run_until(500, |sim| {
        sim.core(leader)
            .membership()
            .get(4)
            .is_some_and(|n| n.role == NodeRole::Voting)
    });
    assert!(promoted, "caught-up node should be promoted");
    assert_eq!(sim.core(leader).membership().voter_count(), 4);
    assert!(sim.run_until(200, |sim| sim.nodes[&4].kv.get("k9").is_some()));
}

/// Removed node ids are never handed out again
#[test]
fn test_removed_id_not_reused() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    let victim = (1..=3).find(|id| *id != leader).expect("a follower");

    let (index, _) = sim
        .core_mut(leader)
        .remove_node(victim)
        .expect("remove accepted");
    assert!(sim.wait_applied(&[leader], index));
    assert!(!sim.core(leader).membership().contains(victim));
    assert!(sim.core(leader).used_node_ids().contains(victim));

    assert_eq!(
        sim.core_mut(leader).add_node(victim, "sim-again:7000").map(|(_, _, id)| id),
        Err(RaftError::DuplicateNodeId(victim))
    );
    let (_, _, fresh) = sim
        .core_mut(leader)
        .add_node(0, "sim-new:7000")
        .expect("allocates a fresh id");
    assert!(fresh > 3);
}

/// A node that fell behind a compaction receives the snapshot in chunks
#[test]
fn test_lagging_node_installs_chunked_snapshot() {
    let mut sim = Sim::new(3);
    let leader = sim.elect();
    let lagging = (1..=3).find(|id| *id != leader).expect("a follower");
    sim.isolate(lagging);

    let mut last = 0;
    for i in 0..40 {
        let (index, _) = sim.propose(&[format!("SET key{i} value-{i}").as_str()]);
        last = index;
    }
    let others: Vec<u64> = (1..=3).filter(|id| *id != lagging).collect();
    assert!(sim.wait_applied(&others, last));

    let job = sim.core_mut(leader).begin_snapshot().expect("snapshot starts");
    job.write().expect("in-memory write");
    sim.core_mut(leader)
        .complete_snapshot(job.index)
        .expect("snapshot completes");
    assert!(sim.core(leader).log().first_index() > sim.core(lagging).log().last_index());
    // The image is larger than one chunk, so the transfer takes several rounds.
    let size = sim
        .core(leader)
        .snapshots()
        .current()
        .expect("current snapshot")
        .len();
    assert!(size > sim_timing().snapshot_chunk_size);

    sim.heal();
    assert!(sim.wait_applied(&[lagging], last));
    let (base, _) = sim.core(lagging).snapshots().last_included();
    assert_eq!(base, job.index);
    assert_eq!(
        sim.nodes[&lagging].kv.get("key39").as_deref(),
        Some("value-39")
    );
    sim.assert_committed_prefixes_match();
}

/// A second snapshot cannot start while one is being written
#[test]
fn test_snapshot_in_progress_rejected() {
    let mut sim = Sim::new(1);
    let leader = sim.elect();
    sim.propose(&["SET a 1"]);

    let job = sim.core_mut(leader).begin_snapshot().expect("first snapshot");
    assert!(sim.core_mut(leader).begin_snapshot().is_err());
    sim.core_mut(leader).abort_snapshot();
    assert!(sim.core(leader).snapshots().current().is_none());

    let retry = sim.core_mut(leader).begin_snapshot().expect("retry after abort");
    assert_eq!(retry.index, job.index);
}
