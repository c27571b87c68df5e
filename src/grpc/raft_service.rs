use tonic::{Request, Response, Status};

use crate::proto;
use crate::proto::raft_service_server::RaftService;
use crate::raft::rpc::AppendEntriesRequest;
use crate::raft::RaftHandle;

/// gRPC service for internal Raft communication
pub struct PeerService {
    raft: RaftHandle,
}

impl PeerService {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for PeerService {
    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteRequest>,
    ) -> Result<Response<proto::RequestVoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            prevote = req.prevote,
            "Received RequestVote"
        );

        let response = self
            .raft
            .request_vote(req.into())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(response.into()))
    }

    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat = req.entries.is_empty(),
            "Received AppendEntries"
        );

        let req = AppendEntriesRequest::try_from(req).map_err(|e| e.to_status())?;
        let response = self
            .raft
            .append_entries(req)
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(response.into()))
    }

    async fn install_snapshot(
        &self,
        request: Request<proto::InstallSnapshotRequest>,
    ) -> Result<Response<proto::InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            leader = req.leader_id,
            snapshot_index = req.snapshot_index,
            offset = req.offset,
            len = req.data.len(),
            last_chunk = req.last_chunk,
            "Received InstallSnapshot"
        );

        let response = self
            .raft
            .install_snapshot(req.into())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(response.into()))
    }

    async fn timeout_now(
        &self,
        request: Request<proto::TimeoutNowRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        tracing::debug!(source = req.source_node, term = req.term, "Received TimeoutNow");

        self.raft
            .timeout_now(req.into())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn node_shutdown(
        &self,
        request: Request<proto::NodeShutdownRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        tracing::info!(source = req.source_node, term = req.term, "Received NodeShutdown");

        self.raft
            .node_shutdown(req.into())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(proto::Empty {}))
    }
}
