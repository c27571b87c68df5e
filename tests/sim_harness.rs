//! Deterministic in-memory simulation of a group of [`RaftCore`]s.
//!
//! Messages are delivered synchronously in the order they were queued and
//! every response goes straight back to the sender, so a test controls time
//! with [`Sim::tick`] and connectivity with [`Sim::block`] and friends.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use shardraft::raft::core::{Envelope, RaftEvent, Rpc};
use shardraft::raft::snapshot::SnapshotManager;
use shardraft::raft::{LogIndex, MemoryLog, NodeId, RaftCore, RaftRole, Term, Timing};
use shardraft::statemachine::{CommandBatch, KvReader, KvStateMachine};

pub const DBID: &str = "00000000000000000000000000000001";

/// Upper bound on deliveries per [`Sim::deliver_all`], to catch message storms.
const MAX_DELIVERIES: usize = 100_000;

pub fn sim_addr(id: NodeId) -> String {
    format!("sim-{id}:7000")
}

/// Fast, small timing so elections settle in a few dozen ticks.
pub fn sim_timing() -> Timing {
    Timing {
        election_min_ticks: 10,
        election_max_ticks: 20,
        heartbeat_ticks: 2,
        transfer_timeout_ticks: 40,
        snapshot_chunk_size: 64,
    }
}

pub struct SimNode {
    pub core: RaftCore,
    pub kv: KvReader,
    pub events: Vec<RaftEvent>,
}

impl SimNode {
    fn new(id: NodeId, timing: Timing) -> Self {
        let kv = KvStateMachine::new();
        let reader = kv.reader();
        let core = RaftCore::new(
            id,
            Box::new(MemoryLog::new()),
            SnapshotManager::new(None),
            Box::new(kv),
            timing,
        );
        Self {
            core,
            kv: reader,
            events: Vec::new(),
        }
    }
}

pub struct Sim {
    pub nodes: BTreeMap<NodeId, SimNode>,
    queue: VecDeque<(NodeId, Envelope)>,
    /// Directed links that drop every message.
    blocked: HashSet<(NodeId, NodeId)>,
    /// Every (term, leader) pair ever observed.
    pub leaders_by_term: HashMap<Term, NodeId>,
    timing: Timing,
}

impl Sim {
    /// A group of `n` voters, all bootstrapped with the same membership.
    pub fn new(n: u64) -> Self {
        Self::with_timing(n, sim_timing())
    }

    pub fn with_timing(n: u64, timing: Timing) -> Self {
        let members: Vec<(NodeId, String)> = (1..=n).map(|id| (id, sim_addr(id))).collect();
        let mut sim = Self {
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            blocked: HashSet::new(),
            leaders_by_term: HashMap::new(),
            timing,
        };
        for (id, _) in &members {
            let mut node = SimNode::new(*id, timing);
            node.core
                .bootstrap(DBID.to_string(), &members)
                .expect("bootstrap");
            sim.nodes.insert(*id, node);
        }
        sim.collect_all();
        sim
    }

    /// Adds an empty node that only learns state from a leader.
    pub fn spawn_empty(&mut self, id: NodeId) {
        self.nodes.insert(id, SimNode::new(id, self.timing));
    }

    pub fn core(&self, id: NodeId) -> &RaftCore {
        &self.nodes[&id].core
    }

    pub fn core_mut(&mut self, id: NodeId) -> &mut RaftCore {
        &mut self
            .nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("node {id} not in simulation"))
            .core
    }

    /// Removes a node entirely, as if it crashed.
    pub fn crash(&mut self, id: NodeId) -> Option<SimNode> {
        self.nodes.remove(&id)
    }

    // ------------------------------------------------------------------
    // Connectivity

    pub fn block(&mut self, a: NodeId, b: NodeId) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));
    }

    pub fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            self.block(id, other);
        }
    }

    pub fn partition(&mut self, side_a: &[NodeId], side_b: &[NodeId]) {
        for a in side_a {
            for b in side_b {
                self.block(*a, *b);
            }
        }
    }

    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    // ------------------------------------------------------------------
    // Time and delivery

    /// Advances every node by one tick and delivers the resulting traffic.
    pub fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(&id) {
                // A failed core keeps refusing; the safety checks still see it.
                let _ = node.core.tick();
            }
            self.collect(id);
        }
        self.deliver_all();
        self.observe_leaders();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Ticks until `predicate` holds; false if it never did within `max_ticks`.
    pub fn run_until<F>(&mut self, max_ticks: usize, predicate: F) -> bool
    where
        F: Fn(&Sim) -> bool,
    {
        for _ in 0..max_ticks {
            if predicate(self) {
                return true;
            }
            self.tick();
        }
        predicate(self)
    }

    pub fn deliver_all(&mut self) {
        let mut delivered = 0;
        while let Some((from, envelope)) = self.queue.pop_front() {
            delivered += 1;
            assert!(delivered < MAX_DELIVERIES, "message storm in simulation");
            self.deliver(from, envelope);
        }
    }

    fn deliver(&mut self, from: NodeId, envelope: Envelope) {
        let to = envelope.to;
        let reachable = self.nodes.contains_key(&to) && !self.blocked.contains(&(from, to));
        if !reachable {
            if let Some(node) = self.nodes.get_mut(&from) {
                node.core.handle_rpc_failure(to);
            }
            return;
        }

        match envelope.rpc {
            Rpc::RequestVote(req) => {
                let resp = self.core_mut(to).handle_request_vote(&req);
                self.collect(to);
                self.reply(from, to, resp, |core, resp| {
                    core.handle_request_vote_response(to, &resp)
                });
            }
            Rpc::AppendEntries(req) => {
                let resp = self.core_mut(to).handle_append_entries(&req);
                self.collect(to);
                self.reply(from, to, resp, |core, resp| {
                    core.handle_append_entries_response(to, &resp)
                });
            }
            Rpc::InstallSnapshot(req) => {
                let resp = self.core_mut(to).handle_install_snapshot(&req);
                self.collect(to);
                self.reply(from, to, resp, |core, resp| {
                    core.handle_install_snapshot_response(to, &resp)
                });
            }
            Rpc::TimeoutNow(req) => {
                let _ = self.core_mut(to).handle_timeout_now(&req);
                self.collect(to);
            }
            Rpc::NodeShutdown(req) => {
                let resp = self.core_mut(to).handle_node_shutdown(&req);
                self.collect(to);
                self.reply(from, to, resp, |core, ()| {
                    core.handle_node_shutdown_response(to);
                    Ok(())
                });
            }
        }
    }

    fn reply<R>(
        &mut self,
        from: NodeId,
        to: NodeId,
        resp: shardraft::Result<R>,
        handle: impl FnOnce(&mut RaftCore, R) -> shardraft::Result<()>,
    ) {
        let blocked = self.blocked.contains(&(to, from));
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        match resp {
            Ok(resp) if !blocked => {
                let _ = handle(&mut node.core, resp);
            }
            _ => node.core.handle_rpc_failure(to),
        }
        self.collect(from);
    }

    /// Applies committed entries and moves queued messages and events out of a core.
    fn collect(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let _ = node.core.apply_committed();
        node.events.extend(node.core.take_events());
        for envelope in node.core.take_outbox() {
            self.queue.push_back((id, envelope));
        }
    }

    fn collect_all(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.collect(id);
        }
    }

    fn observe_leaders(&mut self) {
        for (id, node) in &self.nodes {
            if node.core.role() == RaftRole::Leader {
                let term = node.core.state().current_term;
                let previous = self.leaders_by_term.insert(term, *id);
                assert!(
                    previous.is_none() || previous == Some(*id),
                    "two leaders in term {term}: {previous:?} and {id}"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries

    /// The leader of the highest term, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.core.role() == RaftRole::Leader)
            .max_by_key(|(_, n)| n.core.state().current_term)
            .map(|(id, _)| *id)
    }

    pub fn elect(&mut self) -> NodeId {
        assert!(
            self.run_until(500, |sim| sim.leader().is_some()),
            "no leader elected"
        );
        self.leader().expect("leader present")
    }

    /// Proposes a batch of ops on the current leader.
    pub fn propose(&mut self, ops: &[&str]) -> (LogIndex, Term) {
        let leader = self.leader().expect("no leader to propose to");
        let batch = CommandBatch::new(ops.iter().map(|op| op.as_bytes().to_vec()).collect());
        let proposed = self
            .core_mut(leader)
            .propose_command(&batch, 0)
            .expect("leader accepts proposal");
        self.collect(leader);
        self.deliver_all();
        proposed
    }

    pub fn commit_index(&self, id: NodeId) -> LogIndex {
        self.core(id).state().commit_index
    }

    /// Ticks until every listed node has applied `index`.
    pub fn wait_applied(&mut self, ids: &[NodeId], index: LogIndex) -> bool {
        let ids = ids.to_vec();
        self.run_until(500, move |sim| {
            ids.iter()
                .all(|id| sim.core(*id).state().last_applied >= index)
        })
    }

    /// Panics unless every pair of nodes agrees on all entries both have committed.
    pub fn assert_committed_prefixes_match(&self) {
        for (a_id, a) in &self.nodes {
            for (b_id, b) in &self.nodes {
                if a_id >= b_id {
                    continue;
                }
                let upto = a.core.state().commit_index.min(b.core.state().commit_index);
                let from = a.core.log().first_index().max(b.core.log().first_index());
                for index in from..=upto {
                    assert_eq!(
                        a.core.log().term_at(index),
                        b.core.log().term_at(index),
                        "nodes {a_id} and {b_id} disagree at committed index {index}"
                    );
                }
            }
        }
    }
}
