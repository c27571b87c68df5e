//! gRPC wire messages.
//!
//! The messages are declared with `prost` derives; the service stubs come
//! from `build.rs`.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntryMessage {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(uint64, tag = "3")]
    pub id: u64,
    #[prost(uint32, tag = "4")]
    pub kind: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Peer RPCs

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteRequest {
    #[prost(uint64, tag = "1")]
    pub target_node: u64,
    #[prost(uint64, tag = "2")]
    pub source_node: u64,
    #[prost(bool, tag = "3")]
    pub prevote: bool,
    #[prost(uint64, tag = "4")]
    pub term: u64,
    #[prost(uint64, tag = "5")]
    pub candidate_id: u64,
    #[prost(uint64, tag = "6")]
    pub last_log_idx: u64,
    #[prost(uint64, tag = "7")]
    pub last_log_term: u64,
    #[prost(bool, tag = "8")]
    pub transfer_leader: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
    #[prost(bool, tag = "3")]
    pub prevote: bool,
    #[prost(uint64, tag = "4")]
    pub request_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesRequest {
    #[prost(uint64, tag = "1")]
    pub target_node: u64,
    #[prost(uint64, tag = "2")]
    pub source_node: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(uint64, tag = "4")]
    pub leader_id: u64,
    #[prost(uint64, tag = "5")]
    pub msg_id: u64,
    #[prost(uint64, tag = "6")]
    pub prev_log_idx: u64,
    #[prost(uint64, tag = "7")]
    pub prev_log_term: u64,
    #[prost(uint64, tag = "8")]
    pub leader_commit: u64,
    #[prost(message, repeated, tag = "9")]
    pub entries: Vec<LogEntryMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub current_idx: u64,
    #[prost(uint64, tag = "4")]
    pub first_idx: u64,
    #[prost(uint64, tag = "5")]
    pub msg_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotRequest {
    #[prost(uint64, tag = "1")]
    pub target_node: u64,
    #[prost(uint64, tag = "2")]
    pub source_node: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(uint64, tag = "4")]
    pub leader_id: u64,
    #[prost(uint64, tag = "5")]
    pub msg_id: u64,
    #[prost(uint64, tag = "6")]
    pub snapshot_index: u64,
    #[prost(uint64, tag = "7")]
    pub snapshot_term: u64,
    #[prost(uint64, tag = "8")]
    pub offset: u64,
    #[prost(bytes = "vec", tag = "9")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "10")]
    pub last_chunk: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub msg_id: u64,
    #[prost(uint64, tag = "3")]
    pub offset: u64,
    #[prost(bool, tag = "4")]
    pub success: bool,
    #[prost(bool, tag = "5")]
    pub last_chunk: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeoutNowRequest {
    #[prost(uint64, tag = "1")]
    pub target_node: u64,
    #[prost(uint64, tag = "2")]
    pub source_node: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeShutdownRequest {
    #[prost(uint64, tag = "1")]
    pub target_node: u64,
    #[prost(uint64, tag = "2")]
    pub source_node: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
}

// ---------------------------------------------------------------------------
// Admin and client RPCs

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub ops: Vec<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub slot: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub replies: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterInitResponse {
    #[prost(string, tag = "1")]
    pub dbid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterJoinRequest {
    #[prost(string, repeated, tag = "1")]
    pub addrs: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddNodeRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddNodeResponse {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub dbid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveNodeRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeaderRequest {
    #[prost(uint64, tag = "1")]
    pub target: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeaderResponse {
    #[prost(uint64, tag = "1")]
    pub leader_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
    #[prost(bool, tag = "3")]
    pub voting: bool,
    #[prost(string, tag = "4")]
    pub connection: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoResponse {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, optional, tag = "2")]
    pub dbid: Option<String>,
    #[prost(string, tag = "3")]
    pub cluster_state: String,
    #[prost(string, tag = "4")]
    pub role: String,
    #[prost(uint64, tag = "5")]
    pub term: u64,
    #[prost(uint64, optional, tag = "6")]
    pub leader_id: Option<u64>,
    #[prost(string, optional, tag = "7")]
    pub leader_addr: Option<String>,
    #[prost(uint64, tag = "8")]
    pub commit_index: u64,
    #[prost(uint64, tag = "9")]
    pub last_applied: u64,
    #[prost(uint64, tag = "10")]
    pub first_log_index: u64,
    #[prost(uint64, tag = "11")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "12")]
    pub snapshot_last_index: u64,
    #[prost(uint64, tag = "13")]
    pub snapshot_last_term: u64,
    #[prost(bool, tag = "14")]
    pub snapshot_in_progress: bool,
    #[prost(uint64, tag = "15")]
    pub pending_requests: u64,
    #[prost(message, repeated, tag = "16")]
    pub nodes: Vec<NodeMessage>,
    #[prost(uint64, tag = "17")]
    pub shard_groups: u64,
    #[prost(string, optional, tag = "18")]
    pub failure: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardGroupNodeMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardGroupMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint32, tag = "2")]
    pub start_slot: u32,
    #[prost(uint32, tag = "3")]
    pub end_slot: u32,
    #[prost(message, repeated, tag = "4")]
    pub nodes: Vec<ShardGroupNodeMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardGroupLinkRequest {
    #[prost(string, tag = "1")]
    pub addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigGetRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigGetResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<ConfigEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigSetRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DebugCompactRequest {
    #[prost(uint64, tag = "1")]
    pub delay_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DebugCompactResponse {
    /// Last log index covered by the new snapshot.
    #[prost(uint64, tag = "1")]
    pub index: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DebugSendSnapshotRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsedNodeIdsResponse {
    #[prost(uint64, repeated, tag = "1")]
    pub node_ids: Vec<u64>,
}

include!(concat!(env!("OUT_DIR"), "/shardraft.RaftService.rs"));
include!(concat!(env!("OUT_DIR"), "/shardraft.AdminService.rs"));
