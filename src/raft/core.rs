//! The consensus core.
//!
//! `RaftCore` is a synchronous state machine: it is driven by [`RaftCore::tick`]
//! and the `handle_*` methods, queues outbound messages in an outbox and
//! reports what happened through events. It performs no I/O besides the log
//! and snapshot stores it owns, which keeps it deterministic under test and
//! lets a single task own it without locks.

use std::collections::{HashMap, HashSet};

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::log::{LogError, LogStore};
use crate::raft::membership::{ConfigChange, ConnectionState, Membership, NodeRole, UsedNodeIds};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::snapshot::{SnapshotImage, SnapshotInfo, SnapshotJob, SnapshotManager};
use crate::raft::state::{EntryKind, GroupState, LogEntry, LogIndex, NodeId, RaftRole, Term};
use crate::raft::timer::random_election_ticks;
use crate::shard::{ShardGroup, ShardingTable};
use crate::statemachine::{CommandBatch, StateMachine};

/// Replication RPCs allowed in flight per follower before we wait for answers.
const MAX_INFLIGHT: usize = 4;

/// Upper bound on entries carried by one AppendEntries.
const MAX_ENTRIES_PER_APPEND: usize = 256;

/// Heartbeats on which a leader repeats NodeShutdown to an unacknowledging
/// removed node before giving up on it.
const SHUTDOWN_ATTEMPTS: u32 = 10;

/// Protocol timing, expressed in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub election_min_ticks: u64,
    pub election_max_ticks: u64,
    pub heartbeat_ticks: u64,
    pub transfer_timeout_ticks: u64,
    pub snapshot_chunk_size: usize,
}

impl Timing {
    pub fn from_config(config: &NodeConfig) -> Self {
        let ticks = |ms: u64| (ms / config.tick_interval_ms.max(1)).max(1);
        Self {
            election_min_ticks: ticks(config.election_timeout_min_ms),
            election_max_ticks: ticks(config.election_timeout_max_ms),
            heartbeat_ticks: ticks(config.heartbeat_interval_ms),
            transfer_timeout_ticks: ticks(config.transfer_timeout_ms),
            snapshot_chunk_size: config.snapshot_chunk_size.max(1),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// Leader-side replication cursor for one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    inflight: usize,
    snapshot: Option<SnapshotSend>,
    force_snapshot: bool,
}

impl Progress {
    fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: 0,
            inflight: 0,
            snapshot: None,
            force_snapshot: false,
        }
    }

    pub fn sending_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SnapshotSend {
    index: LogIndex,
    term: Term,
    offset: u64,
    msg_id: u64,
}

/// A removed node not yet told about its removal.
#[derive(Debug, Clone)]
struct Retiring {
    addr: String,
    attempts_left: u32,
}

#[derive(Debug, Clone, Copy)]
struct LeaderTransfer {
    target: NodeId,
    elapsed: u64,
    timeout_now_sent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
    NodeShutdown(NodeShutdownRequest),
}

/// An outbound message queued by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub addr: String,
    pub rpc: Rpc,
}

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Command(Vec<Vec<u8>>),
    NoOp,
    NodeAdded { node_id: NodeId, voting: bool },
    NodeRemoved { node_id: NodeId },
    ShardGroup(Result<()>),
    /// The entry payload could not be decoded; nothing was applied.
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEvent {
    Applied {
        index: LogIndex,
        term: Term,
        outcome: ApplyOutcome,
    },
    /// A leadership transfer started on this node finished.
    TransferFinished(Result<NodeId>),
}

pub struct RaftCore {
    id: NodeId,
    dbid: Option<String>,
    state: GroupState,
    log: Box<dyn LogStore>,
    snapshots: SnapshotManager,
    state_machine: Box<dyn StateMachine>,
    membership: Membership,
    used_node_ids: UsedNodeIds,
    shards: ShardingTable,
    progress: HashMap<NodeId, Progress>,
    retiring: HashMap<NodeId, Retiring>,
    votes: HashSet<NodeId>,
    timing: Timing,
    election_elapsed: u64,
    election_timeout: u64,
    heartbeat_elapsed: u64,
    transfer: Option<LeaderTransfer>,
    next_msg_id: u64,
    outbox: Vec<Envelope>,
    events: Vec<RaftEvent>,
    removed: bool,
    failure: Option<String>,
}

impl RaftCore {
    /// Builds a core over existing storage. Identity and term come from the
    /// persisted hard state when present, `id` otherwise.
    pub fn new(
        id: NodeId,
        log: Box<dyn LogStore>,
        snapshots: SnapshotManager,
        state_machine: Box<dyn StateMachine>,
        timing: Timing,
    ) -> Self {
        let hard_state = log.hard_state();
        let mut state = GroupState::new();
        state.current_term = hard_state.term;
        state.voted_for = hard_state.voted_for;
        let id = if hard_state.node_id != 0 {
            hard_state.node_id
        } else {
            id
        };

        Self {
            id,
            dbid: hard_state.dbid,
            state,
            log,
            snapshots,
            state_machine,
            membership: Membership::new(),
            used_node_ids: UsedNodeIds::new(),
            shards: ShardingTable::new(),
            progress: HashMap::new(),
            retiring: HashMap::new(),
            votes: HashSet::new(),
            election_timeout: random_election_ticks(
                timing.election_min_ticks,
                timing.election_max_ticks,
            ),
            timing,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            transfer: None,
            next_msg_id: 1,
            outbox: Vec::new(),
            events: Vec::new(),
            removed: false,
            failure: None,
        }
    }

    /// Restores persisted state: the latest snapshot, then the committed
    /// suffix of the log, replayed through the state machine.
    pub fn restore(&mut self) -> Result<()> {
        let commit_index = self.log.hard_state().commit_index;
        if let Some(image) = self.snapshots.load()? {
            let index = image.info.last_included_index;
            let term = image.info.last_included_term;
            self.load_image(&image)?;
            if self.log.first_index() <= index {
                let compacted = if self.log.term_at(index) == Some(term) {
                    self.log.compact_up_to(index, term)
                } else {
                    self.log.reset(index, term)
                };
                self.storage(compacted)?;
            }
            self.state.commit_index = index;
            self.state.last_applied = index;
        }

        self.state.commit_index = commit_index
            .max(self.state.commit_index)
            .min(self.log.last_index());
        self.apply_committed()?;
        // Nobody is waiting on replayed entries.
        self.events.clear();

        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            commit_index = self.state.commit_index,
            last_index = self.log.last_index(),
            members = self.membership.len(),
            "Restored state"
        );
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Accessors

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn dbid(&self) -> Option<&str> {
        self.dbid.as_deref()
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    pub fn role(&self) -> RaftRole {
        self.state.role
    }

    pub fn is_leader(&self) -> bool {
        self.state.role == RaftRole::Leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.leader_id
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.state
            .leader_id
            .and_then(|id| self.membership.addr_of(id))
            .map(str::to_string)
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub(crate) fn snapshots_mut(&mut self) -> &mut SnapshotManager {
        &mut self.snapshots
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn used_node_ids(&self) -> &UsedNodeIds {
        &self.used_node_ids
    }

    pub fn shards(&self) -> &ShardingTable {
        &self.shards
    }

    pub fn progress(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
        self.reset_election_timer();
    }

    pub fn transfer_target(&self) -> Option<NodeId> {
        self.transfer.map(|t| t.target)
    }

    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<RaftEvent> {
        std::mem::take(&mut self.events)
    }

    /// Records peer reachability, as observed by the transport.
    pub fn set_connection(&mut self, id: NodeId, state: ConnectionState) {
        self.membership.set_connection(id, state);
    }

    // ----------------------------------------------------------------------
    // Cluster lifecycle

    /// Assigns identity after joining an existing cluster.
    pub fn set_identity(&mut self, id: NodeId, dbid: String) -> Result<()> {
        self.id = id;
        self.dbid = Some(dbid);
        self.persist_hard_state()
    }

    /// Seeds an empty log with one committed `AddNode` entry per node at term 1.
    ///
    /// With a single node this node immediately becomes leader.
    pub fn bootstrap(&mut self, dbid: String, nodes: &[(NodeId, String)]) -> Result<()> {
        if self.log.last_index() != 0 || self.state.current_term != 0 {
            return Err(RaftError::ClusterAlreadyInitialized);
        }
        if !nodes.iter().any(|(id, _)| *id == self.id) {
            return Err(RaftError::InvalidNodeId(self.id));
        }

        self.dbid = Some(dbid);
        self.state.current_term = 1;
        let entries: Vec<LogEntry> = nodes
            .iter()
            .enumerate()
            .map(|(i, (id, addr))| {
                let change = ConfigChange {
                    node_id: *id,
                    addr: addr.clone(),
                };
                LogEntry::new(1, i as u64 + 1, EntryKind::AddNode, change.encode())
            })
            .collect();
        let appended = self.log.append(&entries);
        self.storage(appended)?;
        self.state.commit_index = entries.len() as u64;
        self.persist_hard_state()?;
        self.apply_committed()?;
        self.events.clear();

        tracing::info!(
            node_id = self.id,
            nodes = nodes.len(),
            "Bootstrapped cluster"
        );

        if self.membership.voter_count() == 1 {
            self.state.voted_for = Some(self.id);
            self.persist_hard_state()?;
            self.become_leader()?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Timer

    pub fn tick(&mut self) -> Result<()> {
        self.check_healthy()?;
        self.tick_transfer();

        if self.state.role == RaftRole::Leader {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.timing.heartbeat_ticks {
                self.heartbeat_elapsed = 0;
                self.broadcast_append();
                self.send_node_shutdowns();
            }
            return Ok(());
        }

        self.election_elapsed += 1;
        if self.election_elapsed >= self.election_timeout && self.can_campaign() {
            tracing::info!(
                node_id = self.id,
                term = self.state.current_term,
                elapsed_ticks = self.election_elapsed,
                "Election timeout, starting pre-vote"
            );
            self.start_pre_vote()?;
        }
        Ok(())
    }

    fn tick_transfer(&mut self) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        transfer.elapsed += 1;
        if transfer.elapsed >= self.timing.transfer_timeout_ticks {
            tracing::warn!(
                node_id = self.id,
                target = transfer.target,
                "Leadership transfer timed out"
            );
            self.finish_transfer(Err(RaftError::Timeout));
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout =
            random_election_ticks(self.timing.election_min_ticks, self.timing.election_max_ticks);
    }

    /// True while a leader is known and has been heard from within the
    /// minimum election timeout.
    pub(crate) fn leader_is_active(&self) -> bool {
        match self.state.leader_id {
            None => false,
            Some(_) if self.state.role == RaftRole::Leader => true,
            Some(_) => self.election_elapsed < self.timing.election_min_ticks,
        }
    }

    pub(crate) fn can_campaign(&self) -> bool {
        self.id != 0 && !self.removed && self.membership.is_voter(self.id)
    }

    // ----------------------------------------------------------------------
    // Elections

    fn start_pre_vote(&mut self) -> Result<()> {
        self.reset_election_timer();
        self.state.become_pre_candidate();
        self.votes.clear();
        self.votes.insert(self.id);
        if self.votes.len() >= self.membership.quorum() {
            return self.start_election(false);
        }
        self.broadcast_vote_request(true, self.state.current_term + 1, false);
        Ok(())
    }

    pub(crate) fn start_election(&mut self, transfer: bool) -> Result<()> {
        self.reset_election_timer();
        self.state.become_candidate(self.id);
        self.persist_hard_state()?;
        self.votes.clear();
        self.votes.insert(self.id);

        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            transfer,
            "Starting election"
        );

        if self.votes.len() >= self.membership.quorum() {
            return self.become_leader();
        }
        self.broadcast_vote_request(false, self.state.current_term, transfer);
        Ok(())
    }

    fn broadcast_vote_request(&mut self, prevote: bool, term: Term, transfer: bool) {
        let last_log_idx = self.log.last_index();
        let last_log_term = self.log.last_term();
        let voters: Vec<NodeId> = self.membership.voters().filter(|v| *v != self.id).collect();
        for peer in voters {
            let Some(addr) = self.membership.addr_of(peer).map(str::to_string) else {
                continue;
            };
            self.outbox.push(Envelope {
                to: peer,
                addr,
                rpc: Rpc::RequestVote(RequestVoteRequest {
                    target_node: peer,
                    source_node: self.id,
                    prevote,
                    term,
                    candidate_id: self.id,
                    last_log_idx,
                    last_log_term,
                    transfer_leader: transfer,
                }),
            });
        }
    }

    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: &RequestVoteResponse,
    ) -> Result<()> {
        self.check_healthy()?;
        self.set_connection(from, ConnectionState::Connected);

        if resp.term > self.state.current_term && !(resp.prevote && resp.vote_granted) {
            tracing::info!(
                node_id = self.id,
                term = resp.term,
                "Higher term in vote response, stepping down"
            );
            return self.step_down(resp.term, None);
        }

        let expected_role = if resp.prevote {
            resp.request_term == self.state.current_term + 1
                && self.state.role == RaftRole::PreCandidate
        } else {
            resp.request_term == self.state.current_term && self.state.role == RaftRole::Candidate
        };
        if !expected_role || !resp.vote_granted || !self.membership.is_voter(from) {
            return Ok(());
        }

        self.votes.insert(from);
        tracing::debug!(
            node_id = self.id,
            from,
            prevote = resp.prevote,
            votes = self.votes.len(),
            needed = self.membership.quorum(),
            "Received vote"
        );
        if self.votes.len() < self.membership.quorum() {
            return Ok(());
        }
        if resp.prevote {
            self.start_election(false)
        } else {
            self.become_leader()
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        self.state.become_leader(self.id);
        self.heartbeat_elapsed = 0;
        let next_index = self.log.last_index() + 1;
        self.progress = self
            .membership
            .nodes()
            .filter(|n| n.id != self.id)
            .map(|n| (n.id, Progress::new(next_index)))
            .collect();

        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            votes = self.votes.len(),
            "Became leader"
        );
        self.note_leader(self.id);

        self.append_local(EntryKind::NoOp, Vec::new(), 0)?;
        Ok(())
    }

    /// Reverts to follower, adopting `term` if newer, and persists the change.
    pub(crate) fn step_down(&mut self, term: Term, leader_id: Option<NodeId>) -> Result<()> {
        let was = self.state.role;
        self.state.become_follower(term, leader_id);
        self.votes.clear();
        if was == RaftRole::Leader {
            self.progress.clear();
            self.retiring.clear();
            tracing::info!(node_id = self.id, term, "Stepped down from leader");
        }
        self.persist_hard_state()
    }

    pub(crate) fn record_vote(&mut self, candidate: NodeId) -> Result<()> {
        self.state.voted_for = Some(candidate);
        self.persist_hard_state()?;
        self.election_elapsed = 0;
        Ok(())
    }

    /// Common handling for any message from a leader of `term` (not stale).
    pub(crate) fn accept_leader(&mut self, term: Term, leader_id: NodeId) -> Result<()> {
        if term > self.state.current_term || self.state.role != RaftRole::Follower {
            self.step_down(term, Some(leader_id))?;
        }
        if self.state.leader_id != Some(leader_id) {
            tracing::info!(
                node_id = self.id,
                leader = leader_id,
                term,
                "Following new leader"
            );
            self.state.leader_id = Some(leader_id);
        }
        self.election_elapsed = 0;
        self.note_leader(leader_id);
        Ok(())
    }

    fn note_leader(&mut self, leader_id: NodeId) {
        let Some(transfer) = self.transfer else {
            return;
        };
        if leader_id == transfer.target {
            tracing::info!(node_id = self.id, leader = leader_id, "Leadership transferred");
            self.finish_transfer(Ok(leader_id));
        } else if transfer.timeout_now_sent || leader_id != self.id {
            self.finish_transfer(Err(RaftError::UnexpectedLeader(leader_id)));
        }
    }

    fn finish_transfer(&mut self, outcome: Result<NodeId>) {
        self.transfer = None;
        self.events.push(RaftEvent::TransferFinished(outcome));
    }

    // ----------------------------------------------------------------------
    // Proposals

    /// Appends a new entry as leader. Returns its index and term.
    pub fn propose(&mut self, kind: EntryKind, payload: Vec<u8>, id: u64) -> Result<(LogIndex, Term)> {
        self.check_healthy()?;
        self.ensure_leader()?;
        if self.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }
        if kind.is_config_change() && self.has_uncommitted_config() {
            return Err(RaftError::ConfigChangeInProgress);
        }
        let index = self.append_local(kind, payload, id)?;
        Ok((index, self.state.current_term))
    }

    pub fn propose_command(&mut self, batch: &CommandBatch, id: u64) -> Result<(LogIndex, Term)> {
        self.propose(EntryKind::Normal, batch.encode(), id)
    }

    /// Starts admitting a node as a non-voting member.
    ///
    /// `node_id == 0` picks a fresh id that has never been used in this cluster.
    pub fn add_node(&mut self, node_id: NodeId, addr: &str) -> Result<(LogIndex, Term, NodeId)> {
        self.ensure_leader()?;
        let node_id = if node_id == 0 {
            self.used_node_ids.allocate()
        } else {
            node_id
        };
        if self.membership.contains(node_id) || self.used_node_ids.contains(node_id) {
            return Err(RaftError::DuplicateNodeId(node_id));
        }
        let change = ConfigChange {
            node_id,
            addr: addr.to_string(),
        };
        let (index, term) = self.propose(EntryKind::AddNonVotingNode, change.encode(), 0)?;
        tracing::info!(node_id = self.id, new_node = node_id, addr, index, "Adding node");
        Ok((index, term, node_id))
    }

    pub fn remove_node(&mut self, node_id: NodeId) -> Result<(LogIndex, Term)> {
        self.ensure_leader()?;
        let Some(node) = self.membership.get(node_id) else {
            return Err(RaftError::UnknownNode(node_id));
        };
        let change = ConfigChange {
            node_id,
            addr: node.addr.clone(),
        };
        let (index, term) = self.propose(EntryKind::RemoveNode, change.encode(), 0)?;
        tracing::info!(node_id = self.id, removed = node_id, index, "Removing node");
        Ok((index, term))
    }

    /// Validates and proposes a shard-group addition or replacement.
    pub fn propose_shard_group(
        &mut self,
        group: &ShardGroup,
        update: bool,
        local_range: (u16, u16),
    ) -> Result<(LogIndex, Term)> {
        self.ensure_leader()?;
        if self.dbid.as_deref() == Some(group.id.as_str()) {
            return Err(RaftError::ShardGroupConflict(
                "shard group id is the local cluster".to_string(),
            ));
        }
        let kind = if update {
            self.shards.check_update(group, local_range)?;
            EntryKind::UpdateShardGroup
        } else {
            self.shards.check_add(group, local_range)?;
            EntryKind::AddShardGroup
        };
        self.propose(kind, group.encode(), 0)
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.state.role == RaftRole::Leader {
            return Ok(());
        }
        Err(RaftError::NotLeader {
            leader_id: self.state.leader_id,
            leader_addr: self.leader_addr(),
        })
    }

    pub fn has_uncommitted_config(&self) -> bool {
        (self.state.commit_index + 1..=self.log.last_index()).any(|i| {
            self.log
                .entry_at(i)
                .is_some_and(|e| e.kind.is_config_change())
        })
    }

    fn append_local(&mut self, kind: EntryKind, payload: Vec<u8>, id: u64) -> Result<LogIndex> {
        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(self.state.current_term, index, kind, payload).with_id(id);
        let appended = self.log.append(std::slice::from_ref(&entry));
        self.storage(appended)?;
        tracing::debug!(
            node_id = self.id,
            index,
            term = entry.term,
            kind = ?kind,
            "Appended entry"
        );
        self.maybe_commit();
        self.broadcast_append();
        Ok(index)
    }

    // ----------------------------------------------------------------------
    // Leadership transfer

    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<()> {
        if target == self.id {
            return Err(RaftError::TransferToSelf);
        }
        self.ensure_leader()?;
        if self.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }
        if !self.membership.is_voter(target) {
            return Err(RaftError::UnknownNode(target));
        }

        tracing::info!(node_id = self.id, target, "Starting leadership transfer");
        self.transfer = Some(LeaderTransfer {
            target,
            elapsed: 0,
            timeout_now_sent: false,
        });
        if !self.maybe_send_timeout_now() {
            self.send_append(target);
        }
        Ok(())
    }

    /// Sends TimeoutNow once the transfer target holds our whole log.
    fn maybe_send_timeout_now(&mut self) -> bool {
        let Some(transfer) = self.transfer else {
            return false;
        };
        if transfer.timeout_now_sent || self.state.role != RaftRole::Leader {
            return false;
        }
        let caught_up = self
            .progress
            .get(&transfer.target)
            .is_some_and(|p| p.match_index == self.log.last_index());
        let Some(addr) = self.membership.addr_of(transfer.target).map(str::to_string) else {
            return false;
        };
        if !caught_up {
            return false;
        }

        tracing::info!(
            node_id = self.id,
            target = transfer.target,
            "Target caught up, sending TimeoutNow"
        );
        self.outbox.push(Envelope {
            to: transfer.target,
            addr,
            rpc: Rpc::TimeoutNow(TimeoutNowRequest {
                target_node: transfer.target,
                source_node: self.id,
                term: self.state.current_term,
            }),
        });
        if let Some(t) = self.transfer.as_mut() {
            t.timeout_now_sent = true;
        }
        true
    }

    // ----------------------------------------------------------------------
    // Replication (leader side)

    fn next_msg_id(&mut self) -> u64 {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        id
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        if self.state.role != RaftRole::Leader {
            return;
        }
        let Some(addr) = self.membership.addr_of(peer).map(str::to_string) else {
            return;
        };
        let Some(progress) = self.progress.get(&peer) else {
            return;
        };
        if progress.inflight >= MAX_INFLIGHT {
            return;
        }

        let prev_log_idx = progress.next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_idx);
        if progress.force_snapshot || progress.snapshot.is_some() || prev_log_term.is_none() {
            self.send_snapshot_chunk(peer, addr);
            return;
        }

        let entries = self
            .log
            .entries_from(progress.next_index, MAX_ENTRIES_PER_APPEND);
        let msg_id = self.next_msg_id();
        let req = AppendEntriesRequest {
            target_node: peer,
            source_node: self.id,
            term: self.state.current_term,
            leader_id: self.id,
            msg_id,
            prev_log_idx,
            prev_log_term: prev_log_term.unwrap_or(0),
            leader_commit: self.state.commit_index,
            entries,
        };
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.inflight += 1;
        }
        self.outbox.push(Envelope {
            to: peer,
            addr,
            rpc: Rpc::AppendEntries(req),
        });
    }

    fn send_snapshot_chunk(&mut self, peer: NodeId, addr: String) {
        let Some(snapshot) = self.snapshots.current() else {
            tracing::warn!(node_id = self.id, peer, "No snapshot available to send");
            if let Some(progress) = self.progress.get_mut(&peer) {
                progress.force_snapshot = false;
            }
            return;
        };
        let (index, term) = (snapshot.index(), snapshot.term());
        let chunk_size = self.timing.snapshot_chunk_size;

        let current = self.progress.get(&peer).and_then(|p| p.snapshot);
        let send = match current {
            Some(send) if send.index == index => send,
            _ => {
                tracing::info!(node_id = self.id, peer, index, term, "Sending snapshot");
                SnapshotSend {
                    index,
                    term,
                    offset: 0,
                    msg_id: self.next_msg_id(),
                }
            }
        };
        let Some(chunk) = self
            .snapshots
            .next_chunk(send.offset, chunk_size)
            .or_else(|| self.snapshots.next_chunk(0, chunk_size))
        else {
            return;
        };

        let req = InstallSnapshotRequest {
            target_node: peer,
            source_node: self.id,
            term: self.state.current_term,
            leader_id: self.id,
            msg_id: send.msg_id,
            snapshot_index: index,
            snapshot_term: term,
            chunk,
        };
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.snapshot = Some(SnapshotSend {
                offset: req.chunk.offset,
                ..send
            });
            progress.inflight += 1;
        }
        self.outbox.push(Envelope {
            to: peer,
            addr,
            rpc: Rpc::InstallSnapshot(req),
        });
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: &AppendEntriesResponse,
    ) -> Result<()> {
        self.check_healthy()?;
        self.release_inflight(from);
        self.set_connection(from, ConnectionState::Connected);

        if resp.term > self.state.current_term {
            tracing::info!(
                node_id = self.id,
                from,
                term = resp.term,
                "Higher term in AppendEntries response, stepping down"
            );
            return self.step_down(resp.term, None);
        }
        if self.state.role != RaftRole::Leader || resp.term < self.state.current_term {
            return Ok(());
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };

        if resp.success {
            progress.match_index = progress.match_index.max(resp.current_idx.min(last_index));
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let more = progress.next_index <= last_index;

            self.maybe_commit();
            self.maybe_promote(from)?;
            if !self.maybe_send_timeout_now() && more {
                self.send_append(from);
            }
        } else {
            let next = progress
                .next_index
                .saturating_sub(1)
                .min(resp.current_idx.saturating_add(1))
                .max(progress.match_index + 1)
                .max(1);
            tracing::debug!(
                node_id = self.id,
                from,
                next_index = next,
                "Follower rejected AppendEntries, backing off"
            );
            progress.next_index = next;
            self.send_append(from);
        }
        Ok(())
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        resp: &InstallSnapshotResponse,
    ) -> Result<()> {
        self.check_healthy()?;
        self.release_inflight(from);
        self.set_connection(from, ConnectionState::Connected);

        if resp.term > self.state.current_term {
            return self.step_down(resp.term, None);
        }
        if self.state.role != RaftRole::Leader || resp.term < self.state.current_term {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        let Some(send) = progress.snapshot.filter(|s| s.msg_id == resp.msg_id) else {
            return Ok(());
        };

        if resp.success && resp.last_chunk {
            progress.snapshot = None;
            progress.force_snapshot = false;
            progress.match_index = progress.match_index.max(send.index);
            progress.next_index = progress.match_index + 1;
            tracing::info!(
                node_id = self.id,
                peer = from,
                index = send.index,
                "Snapshot delivered"
            );
            self.maybe_commit();
            self.maybe_promote(from)?;
            if !self.maybe_send_timeout_now() {
                self.send_append(from);
            }
        } else if resp.success {
            progress.snapshot = Some(SnapshotSend {
                offset: resp.offset,
                ..send
            });
            self.send_append(from);
        } else {
            // Resume where the follower asks, on the next heartbeat.
            progress.snapshot = Some(SnapshotSend {
                offset: resp.offset,
                ..send
            });
        }
        Ok(())
    }

    /// An RPC to `peer` failed in transport or timed out.
    pub fn handle_rpc_failure(&mut self, peer: NodeId) {
        self.release_inflight(peer);
        self.set_connection(peer, ConnectionState::Disconnected);
    }

    fn release_inflight(&mut self, peer: NodeId) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.inflight = progress.inflight.saturating_sub(1);
        }
    }

    /// Forces the next replication round to `peer` to ship a snapshot.
    pub fn force_snapshot_send(&mut self, peer: NodeId) -> Result<()> {
        self.ensure_leader()?;
        if self.snapshots.current().is_none() {
            return Err(RaftError::Snapshot(
                crate::raft::snapshot::SnapshotError::NotFound,
            ));
        }
        let Some(progress) = self.progress.get_mut(&peer) else {
            return Err(RaftError::UnknownNode(peer));
        };
        progress.force_snapshot = true;
        self.send_append(peer);
        Ok(())
    }

    /// Advances the commit index to the highest index stored on a majority of
    /// voters that belongs to the current term.
    fn maybe_commit(&mut self) {
        if self.state.role != RaftRole::Leader {
            return;
        }
        let mut matched: Vec<LogIndex> = self
            .membership
            .voters()
            .map(|v| {
                if v == self.id {
                    self.log.last_index()
                } else {
                    self.progress.get(&v).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.quorum() - 1];
        if candidate > self.state.commit_index
            && self.log.term_at(candidate) == Some(self.state.current_term)
        {
            tracing::debug!(node_id = self.id, commit_index = candidate, "Advanced commit index");
            self.advance_commit(candidate);
        }
    }

    pub(crate) fn advance_commit(&mut self, index: LogIndex) {
        if index > self.state.commit_index {
            self.state.commit_index = index;
        }
    }

    /// Promotes a caught-up non-voting node.
    fn maybe_promote(&mut self, peer: NodeId) -> Result<()> {
        let Some(node) = self.membership.get(peer) else {
            return Ok(());
        };
        if node.role != NodeRole::NonVoting || self.transfer.is_some() || self.has_uncommitted_config()
        {
            return Ok(());
        }
        let caught_up = self
            .progress
            .get(&peer)
            .is_some_and(|p| p.match_index >= self.state.commit_index);
        if !caught_up {
            return Ok(());
        }
        let change = ConfigChange {
            node_id: peer,
            addr: node.addr.clone(),
        };
        tracing::info!(node_id = self.id, peer, "Promoting node to voter");
        self.append_local(EntryKind::AddNode, change.encode(), 0)?;
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Follower log maintenance

    /// Appends entries from the leader, truncating any conflicting suffix.
    pub(crate) fn append_from_leader(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut start = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.state.commit_index {
                        return Err(self.fail(format!(
                            "leader conflicts with committed entry {}",
                            entry.index
                        )));
                    }
                    tracing::info!(
                        node_id = self.id,
                        index = entry.index,
                        "Truncating conflicting log suffix"
                    );
                    let truncated = self.log.truncate_from(entry.index);
                    self.storage(truncated)?;
                    start = i;
                    break;
                }
                None => {
                    start = i;
                    break;
                }
            }
        }
        if start < entries.len() {
            let appended = self.log.append(&entries[start..]);
            self.storage(appended)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Apply

    /// Applies every committed, unapplied entry in index order.
    pub fn apply_committed(&mut self) -> Result<usize> {
        self.check_healthy()?;
        let mut applied = 0;
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let Some(entry) = self.log.entry_at(index).cloned() else {
                return Err(self.fail(format!("committed entry {index} missing from log")));
            };
            let outcome = self.apply_entry(&entry)?;
            self.state.last_applied = index;
            self.events.push(RaftEvent::Applied {
                index,
                term: entry.term,
                outcome,
            });
            applied += 1;
        }
        if applied > 0 {
            self.persist_hard_state()?;
        }
        Ok(applied)
    }

    fn apply_entry(&mut self, entry: &LogEntry) -> Result<ApplyOutcome> {
        let outcome = match entry.kind {
            EntryKind::NoOp => ApplyOutcome::NoOp,
            EntryKind::Normal => match CommandBatch::decode(&entry.payload) {
                Ok(batch) => ApplyOutcome::Command(self.state_machine.apply(entry.index, &batch)),
                Err(e) => ApplyOutcome::Invalid(e.to_string()),
            },
            EntryKind::AddNonVotingNode | EntryKind::AddNode | EntryKind::RemoveNode => {
                match ConfigChange::decode(&entry.payload) {
                    Ok(change) => self.apply_config_change(entry.kind, &change)?,
                    Err(e) => ApplyOutcome::Invalid(e.to_string()),
                }
            }
            EntryKind::AddShardGroup | EntryKind::UpdateShardGroup => {
                match ShardGroup::decode(&entry.payload) {
                    Ok(group) => {
                        let id = group.id.clone();
                        let result = self.shards.apply(group);
                        if let Err(e) = &result {
                            tracing::warn!(node_id = self.id, group = %id, error = %e, "Shard group entry rejected");
                        }
                        ApplyOutcome::ShardGroup(result)
                    }
                    Err(e) => ApplyOutcome::Invalid(e.to_string()),
                }
            }
        };
        Ok(outcome)
    }

    fn apply_config_change(&mut self, kind: EntryKind, change: &ConfigChange) -> Result<ApplyOutcome> {
        self.membership.apply(kind, change);
        let node_id = change.node_id;

        if kind == EntryKind::RemoveNode {
            tracing::info!(node_id = self.id, removed = node_id, "Node removed from cluster");
            self.progress.remove(&node_id);
            if self.transfer.is_some_and(|t| t.target == node_id) {
                self.finish_transfer(Err(RaftError::TransferFailed(format!(
                    "node {node_id} was removed"
                ))));
            }
            if node_id == self.id {
                self.removed = true;
                if self.state.role != RaftRole::Follower {
                    let term = self.state.current_term;
                    self.step_down(term, None)?;
                }
            } else if self.state.role == RaftRole::Leader {
                self.retiring.insert(
                    node_id,
                    Retiring {
                        addr: change.addr.clone(),
                        attempts_left: SHUTDOWN_ATTEMPTS,
                    },
                );
                self.send_node_shutdown(node_id);
            }
            return Ok(ApplyOutcome::NodeRemoved { node_id });
        }

        self.used_node_ids.record(node_id);
        let voting = kind == EntryKind::AddNode;
        tracing::info!(node_id = self.id, added = node_id, voting, "Membership updated");
        if node_id == self.id {
            self.removed = false;
        }
        if self.state.role == RaftRole::Leader
            && node_id != self.id
            && !self.progress.contains_key(&node_id)
        {
            let next_index = self.log.last_index() + 1;
            self.progress.insert(node_id, Progress::new(next_index));
            self.send_append(node_id);
        }
        Ok(ApplyOutcome::NodeAdded { node_id, voting })
    }

    // ----------------------------------------------------------------------
    // Snapshots

    /// True when enough entries were applied since the last snapshot.
    pub fn snapshot_due(&self, threshold: u64) -> bool {
        let (snapshot_index, _) = self.snapshots.last_included();
        threshold > 0
            && !self.snapshots.in_progress()
            && self.state.last_applied.saturating_sub(snapshot_index) >= threshold
    }

    /// Captures a snapshot at `last_applied`. The returned job must be written
    /// in the background and then confirmed with [`RaftCore::complete_snapshot`].
    pub fn begin_snapshot(&mut self) -> Result<SnapshotJob> {
        let index = self.state.last_applied;
        if index == 0 {
            return Err(RaftError::Snapshot(
                crate::raft::snapshot::SnapshotError::NotFound,
            ));
        }
        let term = match self.log.term_at(index) {
            Some(term) => term,
            None => self.snapshots.last_included().1,
        };
        let info = SnapshotInfo {
            last_included_index: index,
            last_included_term: term,
            used_node_ids: self.used_node_ids.clone(),
            membership: self.membership.clone(),
        };
        let image = SnapshotImage::new(info, self.shards.clone(), self.state_machine.snapshot());
        let job = self.snapshots.begin(&image)?;
        tracing::info!(node_id = self.id, index, term, "Snapshot started");
        Ok(job)
    }

    /// Makes the written snapshot current and compacts the log behind it.
    pub fn complete_snapshot(&mut self, index: LogIndex) -> Result<SnapshotInfo> {
        let info = self.snapshots.complete(index)?;
        let compacted = self
            .log
            .compact_up_to(info.last_included_index, info.last_included_term);
        self.storage(compacted)?;
        tracing::info!(
            node_id = self.id,
            index = info.last_included_index,
            first_index = self.log.first_index(),
            "Snapshot complete, log compacted"
        );
        Ok(info)
    }

    pub fn abort_snapshot(&mut self) {
        self.snapshots.abort();
    }

    /// Replaces local state with a received snapshot image.
    pub(crate) fn install_snapshot_image(&mut self, image: SnapshotImage) -> Result<()> {
        let index = image.info.last_included_index;
        let term = image.info.last_included_term;
        self.snapshots.install(&image)?;
        self.load_image(&image)?;

        let rebased = if self.log.term_at(index) == Some(term) {
            self.log.compact_up_to(index, term)
        } else {
            self.log.reset(index, term)
        };
        self.storage(rebased)?;

        self.advance_commit(index);
        self.state.last_applied = index;
        self.persist_hard_state()?;
        tracing::info!(node_id = self.id, index, term, "Installed snapshot");
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Removal notice

    fn send_node_shutdowns(&mut self) {
        let ids: Vec<NodeId> = self.retiring.keys().copied().collect();
        for id in ids {
            self.send_node_shutdown(id);
        }
    }

    fn send_node_shutdown(&mut self, to: NodeId) {
        let Some(retiring) = self.retiring.get_mut(&to) else {
            return;
        };
        if retiring.attempts_left == 0 {
            tracing::warn!(node_id = self.id, peer_id = to, "Removed node never acknowledged NodeShutdown");
            self.retiring.remove(&to);
            return;
        }
        retiring.attempts_left -= 1;
        let addr = retiring.addr.clone();
        self.outbox.push(Envelope {
            to,
            addr,
            rpc: Rpc::NodeShutdown(NodeShutdownRequest {
                target_node: to,
                source_node: self.id,
                term: self.state.current_term,
            }),
        });
    }

    /// The removed node `from` acknowledged its NodeShutdown.
    pub fn handle_node_shutdown_response(&mut self, from: NodeId) {
        if self.retiring.remove(&from).is_some() {
            tracing::debug!(node_id = self.id, peer_id = from, "Removed node acknowledged shutdown");
        }
    }

    /// Nodes a leader is still notifying of their removal.
    pub fn retiring_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.retiring.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Marks this node removed and leaves any leading or campaigning role.
    pub(crate) fn mark_removed(&mut self) -> Result<()> {
        self.removed = true;
        if self.state.role != RaftRole::Follower {
            let term = self.state.current_term;
            self.step_down(term, None)?;
        }
        Ok(())
    }

    fn load_image(&mut self, image: &SnapshotImage) -> Result<()> {
        self.state_machine.restore(&image.state)?;
        self.membership = image.info.membership.clone();
        self.used_node_ids.merge(&image.info.used_node_ids);
        self.shards = image.shards.clone();
        if !self.membership.contains(self.id) && self.used_node_ids.contains(self.id) {
            self.removed = true;
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Failure handling

    pub(crate) fn check_target(&self, target: NodeId) -> Result<()> {
        self.check_healthy()?;
        if target != self.id {
            return Err(RaftError::InvalidTarget {
                expected: self.id,
                got: target,
            });
        }
        Ok(())
    }

    fn check_healthy(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(RaftError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    /// Marks the group failed; it stops participating until restarted.
    fn fail(&mut self, reason: String) -> RaftError {
        tracing::error!(node_id = self.id, reason = %reason, "Raft group failed");
        self.failure = Some(reason.clone());
        self.state.role = RaftRole::Follower;
        RaftError::Fatal(reason)
    }

    /// Maps a log store result, failing the group on I/O or corruption.
    fn storage<T>(&mut self, result: std::result::Result<T, LogError>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err @ LogError::IndexOutOfRange(_)) => Err(RaftError::Log(err)),
            Err(err) => Err(self.fail(format!("log store: {err}"))),
        }
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        let hard_state = self.state.hard_state(self.id, self.dbid.clone());
        let saved = self.log.save_hard_state(&hard_state);
        self.storage(saved)
    }
}
