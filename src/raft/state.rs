use serde::{Deserialize, Serialize};

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::PreCandidate => write!(f, "pre-candidate"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A batch of client operations for the state machine.
    Normal,
    /// Appended by every new leader so it can commit entries of earlier terms.
    NoOp,
    AddNonVotingNode,
    /// Adds a voting member, or promotes an existing non-voting one.
    AddNode,
    RemoveNode,
    AddShardGroup,
    UpdateShardGroup,
}

impl EntryKind {
    pub fn is_config_change(self) -> bool {
        matches!(
            self,
            EntryKind::AddNonVotingNode | EntryKind::AddNode | EntryKind::RemoveNode
        )
    }

    pub fn as_u32(self) -> u32 {
        match self {
            EntryKind::Normal => 0,
            EntryKind::NoOp => 1,
            EntryKind::AddNonVotingNode => 2,
            EntryKind::AddNode => 3,
            EntryKind::RemoveNode => 4,
            EntryKind::AddShardGroup => 5,
            EntryKind::UpdateShardGroup => 6,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        let kind = match value {
            0 => EntryKind::Normal,
            1 => EntryKind::NoOp,
            2 => EntryKind::AddNonVotingNode,
            3 => EntryKind::AddNode,
            4 => EntryKind::RemoveNode,
            5 => EntryKind::AddShardGroup,
            6 => EntryKind::UpdateShardGroup,
            _ => return None,
        };
        Some(kind)
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Client-assigned token, used only to correlate completions.
    pub id: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            id: 0,
            kind,
            payload,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }
}

/// State that must survive a restart. Written before any reply that depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    /// 0 until the node has been initialised or has joined a cluster.
    pub node_id: NodeId,
    pub dbid: Option<String>,
}

/// Per-group consensus state.
///
/// # Safety invariants
///
/// - `current_term` never decreases, and `voted_for` is reset only when it grows.
/// - A node votes for at most one candidate per term.
/// - `last_applied <= commit_index`, and `commit_index` never decreases.
/// - At most one leader exists per term; a node that sees a higher term
///   immediately reverts to follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub role: RaftRole,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,
}

impl GroupState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: RaftRole::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
        }
    }

    /// Candidate's log is at least as up to date as ours if its last term is
    /// greater, or the terms are equal and its index is not behind.
    pub fn is_log_up_to_date(
        our_last_index: LogIndex,
        our_last_term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> bool {
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower state, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader_id;
    }

    /// Pre-vote never touches the term or the vote.
    pub fn become_pre_candidate(&mut self) {
        self.role = RaftRole::PreCandidate;
        self.leader_id = None;
    }

    pub fn become_candidate(&mut self, my_id: NodeId) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
    }

    pub fn become_leader(&mut self, my_id: NodeId) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
    }

    pub fn hard_state(&self, node_id: NodeId, dbid: Option<String>) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            node_id,
            dbid,
        }
    }
}

impl Default for GroupState {
    fn default() -> Self {
        Self::new()
    }
}
