use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::admin_service::ClientService;
use crate::grpc::raft_service::PeerService;
use crate::proto::admin_service_server::AdminServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftHandle;

pub struct GrpcServer {
    addr: SocketAddr,
    raft: RaftHandle,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft: RaftHandle) -> Self {
        Self { addr, raft }
    }

    /// Serves both services until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let peer_service = PeerService::new(self.raft.clone());
        let client_service = ClientService::new(self.raft);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(peer_service))
            .add_service(AdminServiceServer::new(client_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
