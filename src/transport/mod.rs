//! The network seam between Raft nodes.
//!
//! The consensus loop only ever talks to peers through [`RaftTransport`], so
//! the same node runs over gRPC in production and over the in-process
//! [`LocalNetwork`] in tests.

pub mod local;

pub use local::{LocalNetwork, LocalTransport};

use crate::error::Result;
use crate::raft::pending::AddNodeReply;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::state::NodeId;
use crate::shard::ShardGroup;

/// Delivers peer and cluster-management messages to the node at `addr`.
#[tonic::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, addr: &str, req: RequestVoteRequest)
        -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    async fn timeout_now(&self, addr: &str, req: TimeoutNowRequest) -> Result<()>;

    /// Tells a node the cluster has committed its removal.
    async fn node_shutdown(&self, addr: &str, req: NodeShutdownRequest) -> Result<()>;

    /// Asks the cluster reachable at `addr` to admit a node. Used by joins.
    async fn add_node(&self, addr: &str, node_id: NodeId, node_addr: &str)
        -> Result<AddNodeReply>;

    /// Fetches the local shard group of the cluster at `addr`. Used by links.
    async fn shard_group_get(&self, addr: &str) -> Result<ShardGroup>;
}
