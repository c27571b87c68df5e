//! Shard-group routing.
//!
//! The key space is divided into [`SLOT_COUNT`] hash slots. This group owns a
//! contiguous slot range (from its config); the routing table records which
//! remote groups own other ranges so requests can be redirected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::NodeId;

pub const SLOT_COUNT: u16 = 16384;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupNode {
    pub id: NodeId,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    /// Cluster dbid of the owning group.
    pub id: String,
    pub start_slot: u16,
    pub end_slot: u16,
    pub nodes: Vec<ShardGroupNode>,
}

impl ShardGroup {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RaftError::InvalidArgument(
                "shard group id must not be empty".to_string(),
            ));
        }
        if self.start_slot > self.end_slot || self.end_slot >= SLOT_COUNT {
            return Err(RaftError::InvalidArgument(format!(
                "invalid slot range {}-{}",
                self.start_slot, self.end_slot
            )));
        }
        if self.nodes.is_empty() {
            return Err(RaftError::InvalidArgument(
                "shard group must have at least one node".to_string(),
            ));
        }
        for node in &self.nodes {
            crate::cluster::validate_addr(&node.addr)?;
        }
        Ok(())
    }

    pub fn contains_slot(&self, slot: u16) -> bool {
        (self.start_slot..=self.end_slot).contains(&slot)
    }

    pub fn overlaps(&self, start: u16, end: u16) -> bool {
        self.start_slot <= end && start <= self.end_slot
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RaftError::Malformed(e.to_string()))
    }
}

/// Where a slot is served.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Local,
    Remote(&'a ShardGroup),
    Unassigned,
}

/// Remote shard groups known to this group, keyed by group id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingTable {
    groups: BTreeMap<String, ShardGroup>,
}

impl ShardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ShardGroup> {
        self.groups.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ShardGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Validates a new group against the table and the local slot range.
    pub fn check_add(&self, group: &ShardGroup, local: (u16, u16)) -> Result<()> {
        group.validate()?;
        if self.groups.contains_key(&group.id) {
            return Err(RaftError::ShardGroupConflict(format!(
                "shard group {} already exists",
                group.id
            )));
        }
        self.check_ranges(group, local)
    }

    /// Validates a replacement for an existing group.
    pub fn check_update(&self, group: &ShardGroup, local: (u16, u16)) -> Result<()> {
        group.validate()?;
        if !self.groups.contains_key(&group.id) {
            return Err(RaftError::ShardGroupConflict(format!(
                "shard group {} does not exist",
                group.id
            )));
        }
        self.check_ranges(group, local)
    }

    fn check_ranges(&self, group: &ShardGroup, local: (u16, u16)) -> Result<()> {
        if group.overlaps(local.0, local.1) {
            return Err(RaftError::ShardGroupConflict(format!(
                "slots {}-{} overlap the local range {}-{}",
                group.start_slot, group.end_slot, local.0, local.1
            )));
        }
        self.check_remote_overlap(group)
    }

    fn check_remote_overlap(&self, group: &ShardGroup) -> Result<()> {
        match self
            .groups
            .values()
            .find(|g| g.id != group.id && g.overlaps(group.start_slot, group.end_slot))
        {
            Some(other) => Err(RaftError::ShardGroupConflict(format!(
                "slots {}-{} overlap shard group {}",
                group.start_slot, group.end_slot, other.id
            ))),
            None => Ok(()),
        }
    }

    /// Applies a committed `AddShardGroup` / `UpdateShardGroup` entry.
    ///
    /// Only table-wide checks run here, so every replica reaches the same
    /// decision regardless of its own configuration.
    pub fn apply(&mut self, group: ShardGroup) -> Result<()> {
        group.validate()?;
        self.check_remote_overlap(&group)?;
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    pub fn route(&self, slot: u16, local: (u16, u16)) -> Route<'_> {
        if (local.0..=local.1).contains(&slot) {
            return Route::Local;
        }
        match self.groups.values().find(|g| g.contains_slot(slot)) {
            Some(group) => Route::Remote(group),
            None => Route::Unassigned,
        }
    }
}

/// Maps a key to its hash slot. A non-empty `{tag}` section, if present, is
/// hashed instead of the whole key so related keys share a slot.
pub fn key_slot(key: &[u8]) -> u16 {
    let hashed = hash_tag(key).unwrap_or(key);
    (crc32fast::hash(hashed) % SLOT_COUNT as u32) as u16
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|b| *b == b'{')?;
    let close = key[open + 1..].iter().position(|b| *b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}
