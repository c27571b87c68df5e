use std::time::Duration;

use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::grpc::convert::slot_from_wire;
use crate::proto;
use crate::proto::admin_service_server::AdminService;
use crate::raft::RaftHandle;
use crate::shard::ShardGroup;

/// gRPC service for clients and operators.
///
/// Dropping a call (client disconnect or deadline) drops its pending waiter
/// on the node; the log entry itself is not withdrawn.
pub struct ClientService {
    raft: RaftHandle,
}

impl ClientService {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }
}

fn status(err: RaftError) -> Status {
    err.to_status()
}

#[tonic::async_trait]
impl AdminService for ClientService {
    async fn submit(
        &self,
        request: Request<proto::SubmitRequest>,
    ) -> Result<Response<proto::SubmitResponse>, Status> {
        let req = request.into_inner();
        let slot = slot_from_wire(req.slot).map_err(status)?;
        tracing::debug!(ops = req.ops.len(), slot = ?slot, "Received Submit");

        let replies = self.raft.submit(req.ops, slot).await.map_err(status)?;
        Ok(Response::new(proto::SubmitResponse { replies }))
    }

    async fn cluster_init(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ClusterInitResponse>, Status> {
        let dbid = self.raft.cluster_init().await.map_err(status)?;
        Ok(Response::new(proto::ClusterInitResponse { dbid }))
    }

    async fn cluster_join(
        &self,
        request: Request<proto::ClusterJoinRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        self.raft.cluster_join(req.addrs).await.map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn add_node(
        &self,
        request: Request<proto::AddNodeRequest>,
    ) -> Result<Response<proto::AddNodeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(node_id = req.node_id, addr = %req.addr, "Received AddNode");

        let reply = self
            .raft
            .add_node(req.node_id, &req.addr)
            .await
            .map_err(status)?;
        Ok(Response::new(proto::AddNodeResponse {
            node_id: reply.node_id,
            dbid: reply.dbid,
        }))
    }

    async fn remove_node(
        &self,
        request: Request<proto::RemoveNodeRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        tracing::debug!(node_id = req.node_id, "Received RemoveNode");

        self.raft.remove_node(req.node_id).await.map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn transfer_leader(
        &self,
        request: Request<proto::TransferLeaderRequest>,
    ) -> Result<Response<proto::TransferLeaderResponse>, Status> {
        let req = request.into_inner();
        let leader_id = self
            .raft
            .transfer_leader(req.target)
            .await
            .map_err(status)?;
        Ok(Response::new(proto::TransferLeaderResponse { leader_id }))
    }

    async fn info(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::InfoResponse>, Status> {
        Ok(Response::new((&self.raft.info()).into()))
    }

    async fn shard_group_get(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ShardGroupMessage>, Status> {
        let group = self.raft.shard_group_get().await.map_err(status)?;
        Ok(Response::new((&group).into()))
    }

    async fn shard_group_add(
        &self,
        request: Request<proto::ShardGroupMessage>,
    ) -> Result<Response<proto::Empty>, Status> {
        let group = ShardGroup::try_from(request.into_inner()).map_err(status)?;
        self.raft.shard_group_add(group).await.map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn shard_group_update(
        &self,
        request: Request<proto::ShardGroupMessage>,
    ) -> Result<Response<proto::Empty>, Status> {
        let group = ShardGroup::try_from(request.into_inner()).map_err(status)?;
        self.raft.shard_group_update(group).await.map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn shard_group_link(
        &self,
        request: Request<proto::ShardGroupLinkRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        self.raft.shard_group_link(&req.addr).await.map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn config_get(
        &self,
        request: Request<proto::ConfigGetRequest>,
    ) -> Result<Response<proto::ConfigGetResponse>, Status> {
        let req = request.into_inner();
        let entries = self
            .raft
            .config_get(&req.pattern)
            .await
            .map_err(status)?
            .into_iter()
            .map(|(name, value)| proto::ConfigEntry { name, value })
            .collect();
        Ok(Response::new(proto::ConfigGetResponse { entries }))
    }

    async fn config_set(
        &self,
        request: Request<proto::ConfigSetRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        self.raft
            .config_set(&req.name, &req.value)
            .await
            .map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn debug_compact(
        &self,
        request: Request<proto::DebugCompactRequest>,
    ) -> Result<Response<proto::DebugCompactResponse>, Status> {
        let req = request.into_inner();
        let index = self
            .raft
            .debug_compact(Duration::from_millis(req.delay_ms))
            .await
            .map_err(status)?;
        Ok(Response::new(proto::DebugCompactResponse { index }))
    }

    async fn debug_send_snapshot(
        &self,
        request: Request<proto::DebugSendSnapshotRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        self.raft
            .debug_send_snapshot(req.node_id)
            .await
            .map_err(status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn debug_used_node_ids(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::UsedNodeIdsResponse>, Status> {
        let node_ids = self.raft.used_node_ids().await.map_err(status)?;
        Ok(Response::new(proto::UsedNodeIdsResponse { node_ids }))
    }
}
