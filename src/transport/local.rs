//! In-process transport that routes messages straight to node handles.
//!
//! Links can be cut and restored to simulate network partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::error::{RaftError, Result};
use crate::raft::handle::RaftHandle;
use crate::raft::pending::AddNodeReply;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::state::NodeId;
use crate::shard::ShardGroup;
use crate::transport::RaftTransport;

#[derive(Default)]
struct Registry {
    nodes: HashMap<String, RaftHandle>,
    /// Unordered address pairs whose link is cut.
    cut: HashSet<(String, String)>,
}

/// A set of nodes reachable from each other by address.
#[derive(Default)]
pub struct LocalNetwork {
    registry: RwLock<Registry>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that sends as the node at `from`.
    pub fn transport(self: &Arc<Self>, from: impl Into<String>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            from: from.into(),
        }
    }

    pub fn register(&self, addr: impl Into<String>, handle: RaftHandle) {
        self.write().nodes.insert(addr.into(), handle);
    }

    pub fn unregister(&self, addr: &str) {
        self.write().nodes.remove(addr);
    }

    /// Cuts every link between the two sides.
    pub fn partition(&self, side_a: &[String], side_b: &[String]) {
        let mut registry = self.write();
        for a in side_a {
            for b in side_b {
                registry.cut.insert(link(a, b));
            }
        }
    }

    /// Cuts every link to and from `addr`.
    pub fn isolate(&self, addr: &str) {
        let mut registry = self.write();
        let others: Vec<String> = registry
            .nodes
            .keys()
            .filter(|other| other.as_str() != addr)
            .cloned()
            .collect();
        for other in others {
            registry.cut.insert(link(addr, &other));
        }
    }

    pub fn heal(&self) {
        self.write().cut.clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<RaftHandle> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if registry.cut.contains(&link(from, to)) {
            return Err(RaftError::Transport(format!("link {from} -> {to} is down")));
        }
        registry
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("connection refused: {to}")))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: String,
}

#[tonic::async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(
        &self,
        addr: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.network.route(&self.from, addr)?.request_vote(req).await
    }

    async fn append_entries(
        &self,
        addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.network.route(&self.from, addr)?.append_entries(req).await
    }

    async fn install_snapshot(
        &self,
        addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.network
            .route(&self.from, addr)?
            .install_snapshot(req)
            .await
    }

    async fn timeout_now(&self, addr: &str, req: TimeoutNowRequest) -> Result<()> {
        self.network.route(&self.from, addr)?.timeout_now(req).await
    }

    async fn node_shutdown(&self, addr: &str, req: NodeShutdownRequest) -> Result<()> {
        self.network.route(&self.from, addr)?.node_shutdown(req).await
    }

    async fn add_node(
        &self,
        addr: &str,
        node_id: NodeId,
        node_addr: &str,
    ) -> Result<AddNodeReply> {
        self.network
            .route(&self.from, addr)?
            .add_node(node_id, node_addr)
            .await
    }

    async fn shard_group_get(&self, addr: &str) -> Result<ShardGroup> {
        self.network.route(&self.from, addr)?.shard_group_get().await
    }
}
