use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::{GrpcServer, GrpcTransport};
use crate::raft::{RaftHandle, RaftMessage, RaftNode};
use crate::statemachine::StateMachine;

/// How a freshly started node should enter a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// Wait for an explicit `ClusterInit` or `ClusterJoin`.
    Manual,
    /// Create a new single-node cluster if none was restored from disk.
    Init,
    /// Join through the given addresses if no cluster was restored from disk.
    Join(Vec<String>),
}

/// A Raft group served over gRPC.
pub struct Node {
    config: NodeConfig,
    raft: RaftNode,
    raft_rx: mpsc::Receiver<RaftMessage>,
    handle: RaftHandle,
}

impl Node {
    pub fn new(config: NodeConfig, state_machine: Box<dyn StateMachine>) -> Result<Self> {
        let transport = Arc::new(GrpcTransport::new(Duration::from_millis(
            config.rpc_timeout_ms,
        )));
        let (raft, raft_rx) = RaftNode::new(config.clone(), state_machine, transport)?;
        let handle = raft.handle();
        Ok(Self {
            config,
            raft,
            raft_rx,
            handle,
        })
    }

    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    /// Runs the consensus loop and the gRPC server until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to bind or serve. The
    /// consensus loop logs its own errors.
    pub async fn run(
        self,
        startup: Startup,
        shutdown: CancellationToken,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let raft_shutdown = shutdown.clone();
        let raft_task = tokio::spawn(self.raft.run(self.raft_rx, raft_shutdown));

        if startup != Startup::Manual {
            tokio::spawn(enter_cluster(self.handle.clone(), startup));
        }

        let server = GrpcServer::new(self.config.listen_addr, self.handle);
        let served = server.run(shutdown.clone()).await;

        // The server only returns early on error; stop the loop either way.
        shutdown.cancel();
        let _ = raft_task.await;
        served?;
        Ok(())
    }
}

async fn enter_cluster(handle: RaftHandle, startup: Startup) {
    let loaded = handle
        .wait_for(Duration::from_secs(60), |info| {
            info.cluster_state != crate::raft::ClusterState::Loading
        })
        .await;
    let info = match loaded {
        Ok(info) => info,
        Err(e) => {
            tracing::error!(error = %e, "Node did not finish loading");
            return;
        }
    };
    if info.dbid.is_some() {
        tracing::info!(dbid = ?info.dbid, "Restored existing cluster membership");
        return;
    }

    let result = match startup {
        Startup::Manual => return,
        Startup::Init => handle.cluster_init().await.map(|_| ()),
        Startup::Join(addrs) => {
            // Joining can outlast the default request timeout.
            handle
                .with_request_timeout(Duration::from_secs(24 * 60 * 60))
                .cluster_join(addrs)
                .await
        }
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "Could not enter cluster");
    }
}
