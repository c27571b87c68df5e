//! The caller-facing side of a Raft node.
//!
//! A [`RaftHandle`] never touches consensus state. Each call validates its
//! arguments, enqueues a [`RaftMessage`] carrying a oneshot responder and
//! suspends until the node loop resolves it, the request timeout fires or
//! the call future is dropped. Status is observed through a watch channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::cluster::validate_addr;
use crate::error::{RaftError, Result};
use crate::raft::membership::Node;
use crate::raft::node::RaftMessage;
use crate::raft::pending::{AddNodeReply, ClientId, CorrelationId};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::state::{LogIndex, NodeId, RaftRole, Term};
use crate::shard::ShardGroup;
use crate::statemachine::CommandBatch;

/// Lifecycle of the local node's cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusterState {
    /// Restoring persisted state.
    Loading,
    /// No cluster initialized or joined yet.
    Uninitialized,
    Joining,
    Up,
    /// Stopped participating after a fatal error.
    Down,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Loading => write!(f, "loading"),
            ClusterState::Uninitialized => write!(f, "uninitialized"),
            ClusterState::Joining => write!(f, "joining"),
            ClusterState::Up => write!(f, "up"),
            ClusterState::Down => write!(f, "down"),
        }
    }
}

/// Point-in-time view of a node, published after every loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub dbid: Option<String>,
    pub cluster_state: ClusterState,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_last_index: LogIndex,
    pub snapshot_last_term: Term,
    pub snapshot_in_progress: bool,
    pub pending_requests: usize,
    pub nodes: Vec<Node>,
    pub shard_groups: usize,
    pub failure: Option<String>,
}

impl NodeInfo {
    pub fn loading(node_id: NodeId) -> Self {
        Self {
            node_id,
            dbid: None,
            cluster_state: ClusterState::Loading,
            role: RaftRole::Follower,
            term: 0,
            leader_id: None,
            leader_addr: None,
            commit_index: 0,
            last_applied: 0,
            first_log_index: 1,
            last_log_index: 0,
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            snapshot_in_progress: false,
            pending_requests: 0,
            nodes: Vec::new(),
            shard_groups: 0,
            failure: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn voters(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.role == crate::raft::membership::NodeRole::Voting)
            .count()
    }
}

/// Clone-able handle to a running [`crate::raft::RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    message_tx: mpsc::Sender<RaftMessage>,
    status: watch::Receiver<NodeInfo>,
    request_timeout: Duration,
    next_correlation: Arc<AtomicU64>,
    client_id: Option<ClientId>,
}

/// Tells the node to stop waiting for a call whose future was dropped.
struct CancelOnDrop {
    message_tx: mpsc::Sender<RaftMessage>,
    correlation_id: CorrelationId,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.message_tx.try_send(RaftMessage::Cancel {
                correlation_id: self.correlation_id,
            });
        }
    }
}

impl RaftHandle {
    pub(crate) fn new(
        message_tx: mpsc::Sender<RaftMessage>,
        status: watch::Receiver<NodeInfo>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            message_tx,
            status,
            request_timeout,
            next_correlation: Arc::new(AtomicU64::new(1)),
            client_id: None,
        }
    }

    /// A handle whose calls are attributed to one client connection, so
    /// they can be dropped together by [`RaftHandle::disconnect_client`].
    pub fn for_client(&self, client_id: ClientId) -> Self {
        Self {
            client_id: Some(client_id),
            ..self.clone()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn info(&self) -> NodeInfo {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeInfo> {
        self.status.clone()
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Result<NodeInfo>
    where
        F: Fn(&NodeInfo) -> bool,
    {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                {
                    let info = status.borrow_and_update();
                    if predicate(&info) {
                        return Ok(info.clone());
                    }
                }
                if status.changed().await.is_err() {
                    return Err(RaftError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(RaftError::Timeout))
    }

    /// Sends a message built around a fresh responder and waits for the answer.
    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(CorrelationId, oneshot::Sender<Result<T>>) -> RaftMessage,
    {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(build(correlation_id, response_tx))
            .await
            .map_err(|_| RaftError::Shutdown)?;

        let mut guard = CancelOnDrop {
            message_tx: self.message_tx.clone(),
            correlation_id,
            armed: true,
        };
        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => {
                guard.armed = false;
                result
            }
            Ok(Err(_)) => {
                guard.armed = false;
                if self.message_tx.is_closed() {
                    Err(RaftError::Shutdown)
                } else {
                    Err(RaftError::Cancelled)
                }
            }
            Err(_) => Err(RaftError::Timeout),
        }
    }

    fn check_available(&self) -> Result<()> {
        match self.status.borrow().cluster_state {
            ClusterState::Loading => Err(RaftError::Loading),
            ClusterState::Uninitialized | ClusterState::Joining => Err(RaftError::NoCluster),
            ClusterState::Down => Err(RaftError::ClusterDown),
            ClusterState::Up => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Peer RPCs

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|_, response_tx| RaftMessage::RequestVote { req, response_tx })
            .await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|_, response_tx| RaftMessage::AppendEntries { req, response_tx })
            .await
    }

    pub async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|_, response_tx| RaftMessage::InstallSnapshot { req, response_tx })
            .await
    }

    pub async fn timeout_now(&self, req: TimeoutNowRequest) -> Result<()> {
        self.call(|_, response_tx| RaftMessage::TimeoutNow { req, response_tx })
            .await
    }

    pub async fn node_shutdown(&self, req: NodeShutdownRequest) -> Result<()> {
        self.call(|_, response_tx| RaftMessage::NodeShutdown { req, response_tx })
            .await
    }

    // ----------------------------------------------------------------------
    // Client commands

    /// Appends a batch of ops and waits for their replies once applied.
    ///
    /// With sharding enabled, `slot` names the hash slot the ops touch so
    /// requests for slots owned elsewhere are redirected.
    pub async fn submit(&self, ops: Vec<Vec<u8>>, slot: Option<u16>) -> Result<Vec<Vec<u8>>> {
        if ops.is_empty() {
            return Err(RaftError::InvalidArgument("empty command batch".to_string()));
        }
        self.check_available()?;
        let client_id = self.client_id;
        let batch = CommandBatch::new(ops);
        self.call(|correlation_id, response_tx| RaftMessage::Submit {
            correlation_id,
            client_id,
            batch,
            slot,
            response_tx,
        })
        .await
    }

    /// Drops every pending call of a disconnected client.
    pub async fn disconnect_client(&self, client_id: ClientId) -> Result<()> {
        self.message_tx
            .send(RaftMessage::ClientDisconnect { client_id })
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    // ----------------------------------------------------------------------
    // Membership

    pub async fn cluster_init(&self) -> Result<String> {
        if self.status.borrow().cluster_state == ClusterState::Loading {
            return Err(RaftError::Loading);
        }
        self.call(|_, response_tx| RaftMessage::ClusterInit { response_tx })
            .await
    }

    /// Joins the cluster reachable through any of `addrs`. Resolves once admitted.
    pub async fn cluster_join(&self, addrs: Vec<String>) -> Result<()> {
        if addrs.is_empty() {
            return Err(RaftError::InvalidArgument("no join addresses".to_string()));
        }
        for addr in &addrs {
            validate_addr(addr)?;
        }
        if self.status.borrow().cluster_state == ClusterState::Loading {
            return Err(RaftError::Loading);
        }
        self.call(|_, response_tx| RaftMessage::ClusterJoin { addrs, response_tx })
            .await
    }

    /// Adds a node; `node_id == 0` lets the cluster choose. Resolves when the
    /// node has been admitted as a non-voting member.
    pub async fn add_node(&self, node_id: NodeId, addr: &str) -> Result<AddNodeReply> {
        validate_addr(addr)?;
        self.check_available()?;
        let addr = addr.to_string();
        self.call(|correlation_id, response_tx| RaftMessage::AddNode {
            correlation_id,
            node_id,
            addr,
            response_tx,
        })
        .await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> Result<()> {
        if node_id == 0 {
            return Err(RaftError::InvalidNodeId(node_id));
        }
        self.check_available()?;
        self.call(|correlation_id, response_tx| RaftMessage::RemoveNode {
            correlation_id,
            node_id,
            response_tx,
        })
        .await
    }

    /// Hands leadership to `target`. Resolves with the node that became leader.
    pub async fn transfer_leader(&self, target: NodeId) -> Result<NodeId> {
        if target == 0 {
            return Err(RaftError::InvalidNodeId(target));
        }
        if target == self.status.borrow().node_id {
            return Err(RaftError::TransferToSelf);
        }
        self.check_available()?;
        self.call(|_, response_tx| RaftMessage::TransferLeader {
            target,
            response_tx,
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Shard groups

    /// Describes the local group: its cluster id, slot range and members.
    pub async fn shard_group_get(&self) -> Result<ShardGroup> {
        self.check_available()?;
        self.call(|_, response_tx| RaftMessage::ShardGroupGet { response_tx })
            .await
    }

    pub async fn shard_group_add(&self, group: ShardGroup) -> Result<()> {
        self.propose_shard_group(group, false).await
    }

    pub async fn shard_group_update(&self, group: ShardGroup) -> Result<()> {
        self.propose_shard_group(group, true).await
    }

    async fn propose_shard_group(&self, group: ShardGroup, update: bool) -> Result<()> {
        group.validate()?;
        self.check_available()?;
        self.call(|correlation_id, response_tx| RaftMessage::ShardGroupAdd {
            correlation_id,
            group,
            update,
            response_tx,
        })
        .await
    }

    /// Fetches the shard group of the cluster at `addr` and records it.
    pub async fn shard_group_link(&self, addr: &str) -> Result<()> {
        validate_addr(addr)?;
        self.check_available()?;
        let addr = addr.to_string();
        self.call(|correlation_id, response_tx| RaftMessage::ShardGroupLink {
            correlation_id,
            addr,
            response_tx,
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Config and debug

    pub async fn config_get(&self, pattern: &str) -> Result<Vec<(String, String)>> {
        let pattern = pattern.to_string();
        self.call(|_, response_tx| RaftMessage::ConfigGet {
            pattern,
            response_tx,
        })
        .await
    }

    pub async fn config_set(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = (name.to_string(), value.to_string());
        self.call(|_, response_tx| RaftMessage::ConfigSet {
            name,
            value,
            response_tx,
        })
        .await
    }

    /// Takes a snapshot now; the write is delayed by `delay`. Resolves with
    /// the snapshot index once the log has been compacted.
    pub async fn debug_compact(&self, delay: Duration) -> Result<LogIndex> {
        self.check_available()?;
        self.call(|_, response_tx| RaftMessage::DebugCompact { delay, response_tx })
            .await
    }

    pub async fn debug_send_snapshot(&self, node_id: NodeId) -> Result<()> {
        self.check_available()?;
        self.call(|_, response_tx| RaftMessage::DebugSendSnapshot {
            node_id,
            response_tx,
        })
        .await
    }

    pub async fn used_node_ids(&self) -> Result<Vec<NodeId>> {
        self.call(|_, response_tx| RaftMessage::UsedNodeIds { response_tx })
            .await
    }
}
