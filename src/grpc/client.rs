use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::error::{RaftError, Result};
use crate::proto;
use crate::proto::admin_service_client::AdminServiceClient;
use crate::proto::raft_service_client::RaftServiceClient;
use crate::raft::pending::AddNodeReply;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::state::NodeId;
use crate::shard::ShardGroup;
use crate::transport::RaftTransport;

/// Opens a lazily connecting channel to `addr` (host:port).
pub fn channel(addr: &str, connect_timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|_| RaftError::InvalidAddress(addr.to_string()))?
        .connect_timeout(connect_timeout);
    Ok(endpoint.connect_lazy())
}

/// [`RaftTransport`] over gRPC, keeping one cached client per peer address.
pub struct GrpcTransport {
    connect_timeout: Duration,
    raft_pool: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
    admin_pool: Mutex<HashMap<String, AdminServiceClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            raft_pool: Mutex::new(HashMap::new()),
            admin_pool: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create a cached peer connection
    async fn raft_client(&self, addr: &str) -> Result<RaftServiceClient<Channel>> {
        let mut pool = self.raft_pool.lock().await;
        if let Some(client) = pool.get(addr) {
            return Ok(client.clone());
        }
        let client = RaftServiceClient::new(channel(addr, self.connect_timeout)?);
        tracing::debug!(addr = %addr, "Opened peer channel");
        pool.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn admin_client(&self, addr: &str) -> Result<AdminServiceClient<Channel>> {
        let mut pool = self.admin_pool.lock().await;
        if let Some(client) = pool.get(addr) {
            return Ok(client.clone());
        }
        let client = AdminServiceClient::new(channel(addr, self.connect_timeout)?);
        pool.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

#[tonic::async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(
        &self,
        addr: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut client = self.raft_client(addr).await?;
        let resp = client
            .request_vote(proto::RequestVoteRequest::from(req))
            .await?;
        Ok(resp.into_inner().into())
    }

    async fn append_entries(
        &self,
        addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.raft_client(addr).await?;
        let resp = client
            .append_entries(proto::AppendEntriesRequest::from(req))
            .await?;
        Ok(resp.into_inner().into())
    }

    async fn install_snapshot(
        &self,
        addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut client = self.raft_client(addr).await?;
        let resp = client
            .install_snapshot(proto::InstallSnapshotRequest::from(req))
            .await?;
        Ok(resp.into_inner().into())
    }

    async fn timeout_now(&self, addr: &str, req: TimeoutNowRequest) -> Result<()> {
        let mut client = self.raft_client(addr).await?;
        client
            .timeout_now(proto::TimeoutNowRequest::from(req))
            .await?;
        Ok(())
    }

    async fn node_shutdown(&self, addr: &str, req: NodeShutdownRequest) -> Result<()> {
        let mut client = self.raft_client(addr).await?;
        client
            .node_shutdown(proto::NodeShutdownRequest::from(req))
            .await?;
        Ok(())
    }

    async fn add_node(
        &self,
        addr: &str,
        node_id: NodeId,
        node_addr: &str,
    ) -> Result<AddNodeReply> {
        let mut client = self.admin_client(addr).await?;
        let resp = client
            .add_node(proto::AddNodeRequest {
                node_id,
                addr: node_addr.to_string(),
            })
            .await?
            .into_inner();
        Ok(AddNodeReply {
            node_id: resp.node_id,
            dbid: resp.dbid,
        })
    }

    async fn shard_group_get(&self, addr: &str) -> Result<ShardGroup> {
        let mut client = self.admin_client(addr).await?;
        let resp = client.shard_group_get(proto::Empty {}).await?;
        ShardGroup::try_from(resp.into_inner())
    }
}
