//! Cluster membership and node-id bookkeeping.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::{EntryKind, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Voting,
    /// Receives replication but does not count towards quorum.
    NonVoting,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Voting => write!(f, "voter"),
            NodeRole::NonVoting => write!(f, "non-voter"),
        }
    }
}

/// Last observed reachability of a peer, from the outcome of our RPCs to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: String,
    pub role: NodeRole,
    #[serde(skip)]
    pub connection: ConnectionState,
}

/// Payload of `AddNonVotingNode`, `AddNode` and `RemoveNode` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub node_id: NodeId,
    pub addr: String,
}

impl ConfigChange {
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RaftError::Malformed(e.to_string()))
    }
}

/// Every node id ever admitted to the cluster, in admission order.
///
/// Entries are never removed, so a departed node's id is never handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<NodeId>", into = "Vec<NodeId>")]
pub struct UsedNodeIds {
    order: Vec<NodeId>,
    lookup: HashSet<NodeId>,
}

impl UsedNodeIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already recorded.
    pub fn record(&mut self, id: NodeId) -> bool {
        if self.lookup.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.lookup.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    /// Union with another set, keeping our order and appending unseen ids.
    pub fn merge(&mut self, other: &UsedNodeIds) {
        for id in other.iter() {
            self.record(id);
        }
    }

    /// Picks a random positive id that has never been used.
    pub fn allocate(&self) -> NodeId {
        let mut rng = rand::thread_rng();
        loop {
            // Keep ids in the positive i32 range so every client can represent them.
            let id = rng.gen_range(1..=i32::MAX as u64);
            if !self.contains(id) {
                return id;
            }
        }
    }
}

impl From<Vec<NodeId>> for UsedNodeIds {
    fn from(ids: Vec<NodeId>) -> Self {
        let mut set = UsedNodeIds::new();
        for id in ids {
            set.record(id);
        }
        set
    }
}

impl From<UsedNodeIds> for Vec<NodeId> {
    fn from(set: UsedNodeIds) -> Self {
        set.order
    }
}

/// Current group membership. Changes only when a configuration entry is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    nodes: BTreeMap<NodeId, Node>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.role == NodeRole::Voting)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .values()
            .filter(|n| n.role == NodeRole::Voting)
            .map(|n| n.id)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Votes (or matching replicas) needed for a majority of voters.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn addr_of(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.addr.as_str())
    }

    pub fn set_connection(&mut self, id: NodeId, state: ConnectionState) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.connection = state;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Applies a committed configuration entry.
    pub fn apply(&mut self, kind: EntryKind, change: &ConfigChange) {
        match kind {
            EntryKind::AddNonVotingNode => {
                self.nodes.entry(change.node_id).or_insert_with(|| Node {
                    id: change.node_id,
                    addr: change.addr.clone(),
                    role: NodeRole::NonVoting,
                    connection: ConnectionState::Unknown,
                });
            }
            EntryKind::AddNode => {
                let node = self.nodes.entry(change.node_id).or_insert_with(|| Node {
                    id: change.node_id,
                    addr: change.addr.clone(),
                    role: NodeRole::Voting,
                    connection: ConnectionState::Unknown,
                });
                node.role = NodeRole::Voting;
            }
            EntryKind::RemoveNode => {
                self.nodes.remove(&change.node_id);
            }
            _ => {}
        }
    }
}
