//! Conversions between the consensus types and their gRPC messages.

use crate::error::{RaftError, Result};
use crate::proto;
use crate::raft::handle::NodeInfo;
use crate::raft::membership::NodeRole;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::snapshot::SnapshotChunk;
use crate::raft::state::{EntryKind, LogEntry};
use crate::shard::{ShardGroup, ShardGroupNode};

impl From<&LogEntry> for proto::LogEntryMessage {
    fn from(entry: &LogEntry) -> Self {
        Self {
            term: entry.term,
            index: entry.index,
            id: entry.id,
            kind: entry.kind.as_u32(),
            payload: entry.payload.clone(),
        }
    }
}

impl TryFrom<proto::LogEntryMessage> for LogEntry {
    type Error = RaftError;

    fn try_from(msg: proto::LogEntryMessage) -> Result<Self> {
        let kind = EntryKind::from_u32(msg.kind)
            .ok_or_else(|| RaftError::Malformed(format!("unknown entry type {}", msg.kind)))?;
        Ok(LogEntry::new(msg.term, msg.index, kind, msg.payload).with_id(msg.id))
    }
}

impl From<RequestVoteRequest> for proto::RequestVoteRequest {
    fn from(req: RequestVoteRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            prevote: req.prevote,
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_idx: req.last_log_idx,
            last_log_term: req.last_log_term,
            transfer_leader: req.transfer_leader,
        }
    }
}

impl From<proto::RequestVoteRequest> for RequestVoteRequest {
    fn from(req: proto::RequestVoteRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            prevote: req.prevote,
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_idx: req.last_log_idx,
            last_log_term: req.last_log_term,
            transfer_leader: req.transfer_leader,
        }
    }
}

impl From<RequestVoteResponse> for proto::RequestVoteResponse {
    fn from(resp: RequestVoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
            prevote: resp.prevote,
            request_term: resp.request_term,
        }
    }
}

impl From<proto::RequestVoteResponse> for RequestVoteResponse {
    fn from(resp: proto::RequestVoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
            prevote: resp.prevote,
            request_term: resp.request_term,
        }
    }
}

impl From<AppendEntriesRequest> for proto::AppendEntriesRequest {
    fn from(req: AppendEntriesRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
            leader_id: req.leader_id,
            msg_id: req.msg_id,
            prev_log_idx: req.prev_log_idx,
            prev_log_term: req.prev_log_term,
            leader_commit: req.leader_commit,
            entries: req.entries.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::AppendEntriesRequest> for AppendEntriesRequest {
    type Error = RaftError;

    fn try_from(req: proto::AppendEntriesRequest) -> Result<Self> {
        Ok(Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
            leader_id: req.leader_id,
            msg_id: req.msg_id,
            prev_log_idx: req.prev_log_idx,
            prev_log_term: req.prev_log_term,
            leader_commit: req.leader_commit,
            entries: req
                .entries
                .into_iter()
                .map(LogEntry::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

impl From<AppendEntriesResponse> for proto::AppendEntriesResponse {
    fn from(resp: AppendEntriesResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            current_idx: resp.current_idx,
            first_idx: resp.first_idx,
            msg_id: resp.msg_id,
        }
    }
}

impl From<proto::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(resp: proto::AppendEntriesResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            current_idx: resp.current_idx,
            first_idx: resp.first_idx,
            msg_id: resp.msg_id,
        }
    }
}

impl From<InstallSnapshotRequest> for proto::InstallSnapshotRequest {
    fn from(req: InstallSnapshotRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
            leader_id: req.leader_id,
            msg_id: req.msg_id,
            snapshot_index: req.snapshot_index,
            snapshot_term: req.snapshot_term,
            offset: req.chunk.offset,
            data: req.chunk.data,
            last_chunk: req.chunk.last_chunk,
        }
    }
}

impl From<proto::InstallSnapshotRequest> for InstallSnapshotRequest {
    fn from(req: proto::InstallSnapshotRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
            leader_id: req.leader_id,
            msg_id: req.msg_id,
            snapshot_index: req.snapshot_index,
            snapshot_term: req.snapshot_term,
            chunk: SnapshotChunk {
                offset: req.offset,
                data: req.data,
                last_chunk: req.last_chunk,
            },
        }
    }
}

impl From<InstallSnapshotResponse> for proto::InstallSnapshotResponse {
    fn from(resp: InstallSnapshotResponse) -> Self {
        Self {
            term: resp.term,
            msg_id: resp.msg_id,
            offset: resp.offset,
            success: resp.success,
            last_chunk: resp.last_chunk,
        }
    }
}

impl From<proto::InstallSnapshotResponse> for InstallSnapshotResponse {
    fn from(resp: proto::InstallSnapshotResponse) -> Self {
        Self {
            term: resp.term,
            msg_id: resp.msg_id,
            offset: resp.offset,
            success: resp.success,
            last_chunk: resp.last_chunk,
        }
    }
}

impl From<TimeoutNowRequest> for proto::TimeoutNowRequest {
    fn from(req: TimeoutNowRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
        }
    }
}

impl From<proto::TimeoutNowRequest> for TimeoutNowRequest {
    fn from(req: proto::TimeoutNowRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
        }
    }
}

impl From<NodeShutdownRequest> for proto::NodeShutdownRequest {
    fn from(req: NodeShutdownRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
        }
    }
}

impl From<proto::NodeShutdownRequest> for NodeShutdownRequest {
    fn from(req: proto::NodeShutdownRequest) -> Self {
        Self {
            target_node: req.target_node,
            source_node: req.source_node,
            term: req.term,
        }
    }
}

impl From<&ShardGroup> for proto::ShardGroupMessage {
    fn from(group: &ShardGroup) -> Self {
        Self {
            id: group.id.clone(),
            start_slot: group.start_slot.into(),
            end_slot: group.end_slot.into(),
            nodes: group
                .nodes
                .iter()
                .map(|n| proto::ShardGroupNodeMessage {
                    id: n.id,
                    addr: n.addr.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<proto::ShardGroupMessage> for ShardGroup {
    type Error = RaftError;

    fn try_from(msg: proto::ShardGroupMessage) -> Result<Self> {
        let slot = |value: u32| {
            u16::try_from(value)
                .map_err(|_| RaftError::InvalidArgument(format!("slot {value} out of range")))
        };
        Ok(Self {
            id: msg.id,
            start_slot: slot(msg.start_slot)?,
            end_slot: slot(msg.end_slot)?,
            nodes: msg
                .nodes
                .into_iter()
                .map(|n| ShardGroupNode {
                    id: n.id,
                    addr: n.addr,
                })
                .collect(),
        })
    }
}

impl From<&NodeInfo> for proto::InfoResponse {
    fn from(info: &NodeInfo) -> Self {
        Self {
            node_id: info.node_id,
            dbid: info.dbid.clone(),
            cluster_state: info.cluster_state.to_string(),
            role: info.role.to_string(),
            term: info.term,
            leader_id: info.leader_id,
            leader_addr: info.leader_addr.clone(),
            commit_index: info.commit_index,
            last_applied: info.last_applied,
            first_log_index: info.first_log_index,
            last_log_index: info.last_log_index,
            snapshot_last_index: info.snapshot_last_index,
            snapshot_last_term: info.snapshot_last_term,
            snapshot_in_progress: info.snapshot_in_progress,
            pending_requests: info.pending_requests as u64,
            nodes: info
                .nodes
                .iter()
                .map(|n| proto::NodeMessage {
                    id: n.id,
                    addr: n.addr.clone(),
                    voting: n.role == NodeRole::Voting,
                    connection: n.connection.to_string(),
                })
                .collect(),
            shard_groups: info.shard_groups as u64,
            failure: info.failure.clone(),
        }
    }
}

/// Maps a wire slot onto the slot space, rejecting values that do not fit.
pub fn slot_from_wire(slot: Option<u32>) -> Result<Option<u16>> {
    slot.map(|s| {
        u16::try_from(s).map_err(|_| RaftError::InvalidArgument(format!("slot {s} out of range")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_entry_kind_is_malformed() {
        let msg = proto::LogEntryMessage {
            term: 1,
            index: 1,
            id: 0,
            kind: 99,
            payload: vec![],
        };
        assert!(matches!(LogEntry::try_from(msg), Err(RaftError::Malformed(_))));
    }

    #[test]
    fn test_append_entries_keeps_entry_order() {
        let req = AppendEntriesRequest {
            target_node: 2,
            source_node: 1,
            term: 3,
            leader_id: 1,
            msg_id: 9,
            prev_log_idx: 4,
            prev_log_term: 2,
            leader_commit: 4,
            entries: vec![
                LogEntry::new(3, 5, EntryKind::NoOp, vec![]),
                LogEntry::new(3, 6, EntryKind::Normal, b"SET a 1".to_vec()).with_id(77),
            ],
        };
        let wire = proto::AppendEntriesRequest::from(req.clone());
        assert_eq!(wire.entries[1].id, 77);
        assert_eq!(AppendEntriesRequest::try_from(wire).unwrap(), req);
    }

    #[test]
    fn test_shard_group_slot_out_of_range() {
        let msg = proto::ShardGroupMessage {
            id: "g".to_string(),
            start_slot: 0,
            end_slot: 70_000,
            nodes: vec![],
        };
        assert!(matches!(
            ShardGroup::try_from(msg),
            Err(RaftError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_slot_from_wire() {
        assert_eq!(slot_from_wire(None).unwrap(), None);
        assert_eq!(slot_from_wire(Some(12)).unwrap(), Some(12));
        assert!(slot_from_wire(Some(u32::MAX)).is_err());
    }
}
