use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cluster::{generate_dbid, join_cluster, JoinBackoff};
use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::core::{Envelope, RaftCore, RaftEvent, Rpc, Timing};
use crate::raft::handle::{ClusterState, NodeInfo, RaftHandle};
use crate::raft::log::{LogStore, MemoryLog};
use crate::raft::membership::{ConnectionState, UsedNodeIds};
use crate::raft::pending::{AddNodeReply, ClientId, Completion, CorrelationId, PendingRequests};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeShutdownRequest, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::raft::snapshot::{SnapshotError, SnapshotManager};
use crate::raft::state::{LogIndex, NodeId};
use crate::raft::storage::FileLog;
use crate::shard::{Route, ShardGroup, ShardGroupNode, SLOT_COUNT};
use crate::statemachine::{CommandBatch, StateMachine};
use crate::transport::RaftTransport;

const QUEUE_CAPACITY: usize = 1024;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Incoming RequestVote from a peer
    RequestVote {
        req: RequestVoteRequest,
        response_tx: oneshot::Sender<Result<RequestVoteResponse>>,
    },
    /// Incoming AppendEntries from the leader
    AppendEntries {
        req: AppendEntriesRequest,
        response_tx: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    /// Incoming InstallSnapshot chunk from the leader
    InstallSnapshot {
        req: InstallSnapshotRequest,
        response_tx: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    /// Leader asks us to campaign immediately
    TimeoutNow {
        req: TimeoutNowRequest,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Leader tells us our removal is committed
    NodeShutdown {
        req: NodeShutdownRequest,
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Answer to a RequestVote we sent
    VoteResponse {
        from: NodeId,
        resp: RequestVoteResponse,
    },
    /// Answer to an AppendEntries we sent
    AppendResponse {
        from: NodeId,
        resp: AppendEntriesResponse,
    },
    /// Answer to an InstallSnapshot chunk we sent
    SnapshotResponse {
        from: NodeId,
        resp: InstallSnapshotResponse,
    },
    /// A removed node acknowledged its NodeShutdown
    ShutdownAck {
        from: NodeId,
    },
    /// An outbound RPC failed or timed out
    RpcFailed {
        peer: NodeId,
        replication: bool,
        error: RaftError,
    },

    /// Append a batch of client operations
    Submit {
        correlation_id: CorrelationId,
        client_id: Option<ClientId>,
        batch: CommandBatch,
        slot: Option<u16>,
        response_tx: oneshot::Sender<Result<Vec<Vec<u8>>>>,
    },
    AddNode {
        correlation_id: CorrelationId,
        node_id: NodeId,
        addr: String,
        response_tx: oneshot::Sender<Result<AddNodeReply>>,
    },
    RemoveNode {
        correlation_id: CorrelationId,
        node_id: NodeId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    TransferLeader {
        target: NodeId,
        response_tx: oneshot::Sender<Result<NodeId>>,
    },
    ShardGroupGet {
        response_tx: oneshot::Sender<Result<ShardGroup>>,
    },
    ShardGroupAdd {
        correlation_id: CorrelationId,
        group: ShardGroup,
        update: bool,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ShardGroupLink {
        correlation_id: CorrelationId,
        addr: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Caller stopped waiting for a request
    Cancel { correlation_id: CorrelationId },
    /// A client connection went away
    ClientDisconnect { client_id: ClientId },
    ClusterInit {
        response_tx: oneshot::Sender<Result<String>>,
    },
    ClusterJoin {
        addrs: Vec<String>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ConfigGet {
        pattern: String,
        response_tx: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    ConfigSet {
        name: String,
        value: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    DebugCompact {
        delay: Duration,
        response_tx: oneshot::Sender<Result<LogIndex>>,
    },
    DebugSendSnapshot {
        node_id: NodeId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    UsedNodeIds {
        response_tx: oneshot::Sender<Result<Vec<NodeId>>>,
    },

    /// The background join finished
    Joined { result: Result<AddNodeReply> },
    /// A remote shard group was fetched for a link request
    ShardGroupFetched {
        correlation_id: CorrelationId,
        result: Result<ShardGroup>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// The background snapshot write finished
    SnapshotWritten {
        index: LogIndex,
        result: std::result::Result<(), SnapshotError>,
    },
}

/// The task that owns one Raft group's consensus core.
///
/// All consensus state lives here and is only touched from [`RaftNode::run`];
/// everything else talks to it through a [`RaftHandle`].
pub struct RaftNode {
    config: NodeConfig,
    core: RaftCore,
    transport: Arc<dyn RaftTransport>,
    pending: PendingRequests,
    cluster_state: ClusterState,
    transfer_tx: Option<oneshot::Sender<Result<NodeId>>>,
    join_tx: Option<oneshot::Sender<Result<()>>>,
    snapshot_tx: Option<oneshot::Sender<Result<LogIndex>>>,
    background: CancellationToken,
    message_tx: mpsc::Sender<RaftMessage>,
    status_tx: watch::Sender<NodeInfo>,
    status_rx: watch::Receiver<NodeInfo>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        config.validate()?;
        let log: Box<dyn LogStore> = match &config.data_dir {
            Some(dir) => Box::new(FileLog::open(dir)?),
            None => Box::new(MemoryLog::new()),
        };
        let snapshots = SnapshotManager::new(config.data_dir.clone());
        let core = RaftCore::new(
            config.node_id,
            log,
            snapshots,
            state_machine,
            Timing::from_config(&config),
        );

        let (message_tx, message_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(NodeInfo::loading(core.id()));

        let node = Self {
            config,
            core,
            transport,
            pending: PendingRequests::new(),
            cluster_state: ClusterState::Loading,
            transfer_tx: None,
            join_tx: None,
            snapshot_tx: None,
            background: CancellationToken::new(),
            message_tx,
            status_tx,
            status_rx,
        };
        Ok((node, message_rx))
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle::new(
            self.message_tx.clone(),
            self.status_rx.clone(),
            Duration::from_millis(self.config.request_timeout_ms),
        )
    }

    /// Run the Raft node main loop until `shutdown` is cancelled
    pub async fn run(self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        let Some(mut node) = self.restore().await else {
            return;
        };
        node.flush();

        let mut ticker =
            tokio::time::interval(Duration::from_millis(node.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(msg) = message_rx.recv() => node.handle_message(msg),

                _ = ticker.tick() => node.tick(),
            }
            node.flush();
        }

        node.stop();
    }

    /// Loads the snapshot and replays the committed log off the async threads.
    async fn restore(self) -> Option<Self> {
        let restored = tokio::task::spawn_blocking(move || {
            let mut node = self;
            let result = node.core.restore();
            (node, result)
        })
        .await;

        let (mut node, result) = match restored {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "State restore task failed");
                return None;
            }
        };
        match result {
            Ok(()) if node.core.dbid().is_some() => node.cluster_state = ClusterState::Up,
            Ok(()) => node.cluster_state = ClusterState::Uninitialized,
            Err(e) => node.go_down(format!("restore failed: {e}")),
        }
        tracing::info!(
            node_id = node.core.id(),
            state = %node.cluster_state,
            "Raft node started"
        );
        Some(node)
    }

    fn stop(&mut self) {
        self.background.cancel();
        self.pending.fail_all(&RaftError::Shutdown);
        if let Some(tx) = self.transfer_tx.take() {
            let _ = tx.send(Err(RaftError::Shutdown));
        }
        if let Some(tx) = self.join_tx.take() {
            let _ = tx.send(Err(RaftError::Shutdown));
        }
        if let Some(tx) = self.snapshot_tx.take() {
            let _ = tx.send(Err(RaftError::Shutdown));
        }
        tracing::info!(node_id = self.core.id(), "Raft node stopped");
    }

    fn tick(&mut self) {
        if self.cluster_state != ClusterState::Up {
            return;
        }
        if let Err(e) = self.core.tick() {
            tracing::warn!(node_id = self.core.id(), error = %e, "Tick failed");
        }
    }

    /// Applies committed entries, resolves callers, sends queued RPCs and
    /// publishes status. Runs after every loop iteration.
    fn flush(&mut self) {
        if self.cluster_state != ClusterState::Down {
            if let Some(reason) = self.core.failure().map(str::to_string) {
                self.go_down(reason);
            }
        }
        if self.cluster_state == ClusterState::Up {
            if let Err(e) = self.core.apply_committed() {
                tracing::error!(node_id = self.core.id(), error = %e, "Apply failed");
            }
        }

        for event in self.core.take_events() {
            match event {
                RaftEvent::Applied {
                    index,
                    term,
                    outcome,
                } => self.pending.resolve(index, term, outcome),
                RaftEvent::TransferFinished(result) => {
                    if let Some(tx) = self.transfer_tx.take() {
                        let _ = tx.send(result);
                    }
                }
            }
        }
        if self.cluster_state == ClusterState::Up && self.core.is_removed() {
            self.retire();
        }

        if self.cluster_state == ClusterState::Up
            && self.core.snapshot_due(self.config.snapshot_threshold)
        {
            if let Err(e) = self.start_snapshot(Duration::ZERO) {
                tracing::warn!(node_id = self.core.id(), error = %e, "Could not start snapshot");
            }
        }

        for envelope in self.core.take_outbox() {
            self.dispatch(envelope);
        }
        self.publish();
    }

    fn go_down(&mut self, reason: String) {
        tracing::error!(node_id = self.core.id(), reason = %reason, "Node stopped participating in consensus");
        self.cluster_state = ClusterState::Down;
        let err = RaftError::Fatal(reason);
        self.pending.fail_all(&err);
        if let Some(tx) = self.transfer_tx.take() {
            let _ = tx.send(Err(err.clone()));
        }
        if let Some(tx) = self.snapshot_tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Leaves consensus once this node's removal is known. Queued RPCs are
    /// still sent so a departing leader's last commit reaches the others.
    fn retire(&mut self) {
        tracing::info!(node_id = self.core.id(), "Node removed from cluster");
        self.cluster_state = ClusterState::Down;
        self.pending.fail_all(&RaftError::ClusterDown);
        if let Some(tx) = self.transfer_tx.take() {
            let _ = tx.send(Err(RaftError::ClusterDown));
        }
        if let Some(tx) = self.snapshot_tx.take() {
            let _ = tx.send(Err(RaftError::ClusterDown));
        }
    }

    fn publish(&self) {
        let (snapshot_last_index, snapshot_last_term) = self.core.snapshots().last_included();
        let state = self.core.state();
        let info = NodeInfo {
            node_id: self.core.id(),
            dbid: self.core.dbid().map(str::to_string),
            cluster_state: self.cluster_state,
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            leader_addr: self.core.leader_addr(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            first_log_index: self.core.log().first_index(),
            last_log_index: self.core.log().last_index(),
            snapshot_last_index,
            snapshot_last_term,
            snapshot_in_progress: self.core.snapshots().in_progress(),
            pending_requests: self.pending.len(),
            nodes: self.core.membership().nodes().cloned().collect(),
            shard_groups: self.core.shards().len(),
            failure: self.core.failure().map(str::to_string),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == info {
                return false;
            }
            *current = info;
            true
        });
    }

    // ----------------------------------------------------------------------
    // Outbound RPCs

    /// Sends one queued RPC from a spawned task and posts the answer back.
    fn dispatch(&self, envelope: Envelope) {
        let transport = self.transport.clone();
        let message_tx = self.message_tx.clone();
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let Envelope { to, addr, rpc } = envelope;

        tokio::spawn(async move {
            let msg = match rpc {
                Rpc::RequestVote(req) => {
                    match with_timeout(rpc_timeout, transport.request_vote(&addr, req)).await {
                        Ok(resp) => RaftMessage::VoteResponse { from: to, resp },
                        Err(error) => RaftMessage::RpcFailed {
                            peer: to,
                            replication: false,
                            error,
                        },
                    }
                }
                Rpc::AppendEntries(req) => {
                    match with_timeout(rpc_timeout, transport.append_entries(&addr, req)).await {
                        Ok(resp) => RaftMessage::AppendResponse { from: to, resp },
                        Err(error) => RaftMessage::RpcFailed {
                            peer: to,
                            replication: true,
                            error,
                        },
                    }
                }
                Rpc::InstallSnapshot(req) => {
                    match with_timeout(rpc_timeout, transport.install_snapshot(&addr, req)).await {
                        Ok(resp) => RaftMessage::SnapshotResponse { from: to, resp },
                        Err(error) => RaftMessage::RpcFailed {
                            peer: to,
                            replication: true,
                            error,
                        },
                    }
                }
                Rpc::TimeoutNow(req) => {
                    match with_timeout(rpc_timeout, transport.timeout_now(&addr, req)).await {
                        Ok(()) => return,
                        Err(error) => RaftMessage::RpcFailed {
                            peer: to,
                            replication: false,
                            error,
                        },
                    }
                }
                Rpc::NodeShutdown(req) => {
                    match with_timeout(rpc_timeout, transport.node_shutdown(&addr, req)).await {
                        Ok(()) => RaftMessage::ShutdownAck { from: to },
                        Err(error) => RaftMessage::RpcFailed {
                            peer: to,
                            replication: false,
                            error,
                        },
                    }
                }
            };
            let _ = message_tx.send(msg).await;
        });
    }

    // ----------------------------------------------------------------------
    // Message handling

    fn handle_message(&mut self, msg: RaftMessage) {
        match msg {
            RaftMessage::RequestVote { req, response_tx } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.handle_request_vote(&req));
                let _ = response_tx.send(result);
            }
            RaftMessage::AppendEntries { req, response_tx } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.handle_append_entries(&req));
                let _ = response_tx.send(result);
            }
            RaftMessage::InstallSnapshot { req, response_tx } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.handle_install_snapshot(&req));
                let _ = response_tx.send(result);
            }
            RaftMessage::TimeoutNow { req, response_tx } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.handle_timeout_now(&req));
                let _ = response_tx.send(result);
            }
            RaftMessage::NodeShutdown { req, response_tx } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.handle_node_shutdown(&req));
                let _ = response_tx.send(result);
            }

            RaftMessage::VoteResponse { from, resp } => {
                if let Err(e) = self.core.handle_request_vote_response(from, &resp) {
                    tracing::warn!(node_id = self.core.id(), peer_id = from, error = %e, "Vote response failed");
                }
            }
            RaftMessage::AppendResponse { from, resp } => {
                if let Err(e) = self.core.handle_append_entries_response(from, &resp) {
                    tracing::warn!(node_id = self.core.id(), peer_id = from, error = %e, "AppendEntries response failed");
                }
            }
            RaftMessage::SnapshotResponse { from, resp } => {
                if let Err(e) = self.core.handle_install_snapshot_response(from, &resp) {
                    tracing::warn!(node_id = self.core.id(), peer_id = from, error = %e, "InstallSnapshot response failed");
                }
            }
            RaftMessage::ShutdownAck { from } => self.core.handle_node_shutdown_response(from),
            RaftMessage::RpcFailed {
                peer,
                replication,
                error,
            } => {
                tracing::trace!(node_id = self.core.id(), peer_id = peer, error = %error, "RPC failed");
                if replication {
                    self.core.handle_rpc_failure(peer);
                } else {
                    self.core.set_connection(peer, ConnectionState::Disconnected);
                }
            }

            RaftMessage::Submit {
                correlation_id,
                client_id,
                batch,
                slot,
                response_tx,
            } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.check_slot(slot))
                    .and_then(|_| self.core.propose_command(&batch, correlation_id));
                match result {
                    Ok((index, term)) => self.pending.insert(
                        index,
                        term,
                        correlation_id,
                        client_id,
                        Completion::Submit(response_tx),
                    ),
                    Err(e) => {
                        let _ = response_tx.send(Err(self.availability(e)));
                    }
                }
            }
            RaftMessage::AddNode {
                correlation_id,
                node_id,
                addr,
                response_tx,
            } => self.add_node(correlation_id, node_id, addr, response_tx),
            RaftMessage::RemoveNode {
                correlation_id,
                node_id,
                response_tx,
            } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.remove_node(node_id));
                match result {
                    Ok((index, term)) => self.pending.insert(
                        index,
                        term,
                        correlation_id,
                        None,
                        Completion::Done(response_tx),
                    ),
                    Err(e) => {
                        let _ = response_tx.send(Err(self.availability(e)));
                    }
                }
            }
            RaftMessage::TransferLeader {
                target,
                response_tx,
            } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.transfer_leadership(target));
                match result {
                    Ok(()) => self.transfer_tx = Some(response_tx),
                    Err(e) => {
                        let _ = response_tx.send(Err(self.availability(e)));
                    }
                }
            }
            RaftMessage::ShardGroupGet { response_tx } => {
                let _ = response_tx.send(self.local_shard_group());
            }
            RaftMessage::ShardGroupAdd {
                correlation_id,
                group,
                update,
                response_tx,
            } => self.propose_shard_group(correlation_id, group, update, response_tx),
            RaftMessage::ShardGroupLink {
                correlation_id,
                addr,
                response_tx,
            } => self.shard_group_link(correlation_id, addr, response_tx),
            RaftMessage::ShardGroupFetched {
                correlation_id,
                result,
                response_tx,
            } => match result {
                // Linking the same group twice changes nothing.
                Ok(group) if self.core.shards().get(&group.id) == Some(&group) => {
                    let _ = response_tx.send(Ok(()));
                }
                Ok(group) => {
                    let update = self.core.shards().contains(&group.id);
                    self.propose_shard_group(correlation_id, group, update, response_tx);
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
            RaftMessage::Cancel { correlation_id } => {
                if self.pending.cancel(correlation_id) {
                    tracing::debug!(node_id = self.core.id(), correlation_id, "Pending request cancelled");
                }
            }
            RaftMessage::ClientDisconnect { client_id } => {
                let dropped = self.pending.cancel_client(client_id);
                tracing::debug!(node_id = self.core.id(), client_id, dropped, "Client disconnected");
            }
            RaftMessage::ClusterInit { response_tx } => {
                let _ = response_tx.send(self.cluster_init());
            }
            RaftMessage::ClusterJoin { addrs, response_tx } => {
                self.cluster_join(addrs, response_tx);
            }
            RaftMessage::Joined { result } => self.on_joined(result),
            RaftMessage::ConfigGet {
                pattern,
                response_tx,
            } => {
                let _ = response_tx.send(Ok(self.config.get(&pattern)));
            }
            RaftMessage::ConfigSet {
                name,
                value,
                response_tx,
            } => {
                let result = self.config.set(&name, &value);
                if result.is_ok() {
                    tracing::info!(node_id = self.core.id(), name = %name, value = %value, "Config updated");
                    self.core.set_timing(Timing::from_config(&self.config));
                }
                let _ = response_tx.send(result);
            }
            RaftMessage::DebugCompact { delay, response_tx } => {
                match self.check_up().and_then(|_| self.start_snapshot(delay)) {
                    Ok(_) => self.snapshot_tx = Some(response_tx),
                    Err(e) => {
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            RaftMessage::DebugSendSnapshot {
                node_id,
                response_tx,
            } => {
                let result = self
                    .check_up()
                    .and_then(|_| self.core.force_snapshot_send(node_id));
                let _ = response_tx.send(result);
            }
            RaftMessage::UsedNodeIds { response_tx } => {
                let _ = response_tx.send(Ok(self.core.used_node_ids().iter().collect()));
            }
            RaftMessage::SnapshotWritten { index, result } => {
                let outcome = match result {
                    Ok(()) => self
                        .core
                        .complete_snapshot(index)
                        .map(|info| info.last_included_index),
                    Err(e) => {
                        tracing::warn!(node_id = self.core.id(), index, error = %e, "Snapshot write failed");
                        self.core.abort_snapshot();
                        Err(RaftError::Snapshot(e))
                    }
                };
                if let Some(tx) = self.snapshot_tx.take() {
                    let _ = tx.send(outcome);
                }
            }
        }
    }

    fn check_up(&self) -> Result<()> {
        match self.cluster_state {
            ClusterState::Up => Ok(()),
            ClusterState::Loading => Err(RaftError::Loading),
            ClusterState::Uninitialized | ClusterState::Joining => Err(RaftError::NoCluster),
            ClusterState::Down => Err(RaftError::ClusterDown),
        }
    }

    /// A follower that knows no leader cannot serve writes at all.
    fn availability(&self, err: RaftError) -> RaftError {
        match err {
            RaftError::NotLeader {
                leader_id: None, ..
            } => RaftError::ClusterDown,
            other => other,
        }
    }

    fn check_sharding(&self) -> Result<()> {
        if self.config.sharding.enabled {
            Ok(())
        } else {
            Err(RaftError::ShardingDisabled)
        }
    }

    fn local_range(&self) -> (u16, u16) {
        (self.config.sharding.start_slot, self.config.sharding.end_slot)
    }

    /// Redirects requests for slots this group does not own.
    fn check_slot(&self, slot: Option<u16>) -> Result<()> {
        let Some(slot) = slot.filter(|_| self.config.sharding.enabled) else {
            return Ok(());
        };
        if slot >= SLOT_COUNT {
            return Err(RaftError::InvalidArgument(format!("slot {slot} out of range")));
        }
        match self.core.shards().route(slot, self.local_range()) {
            Route::Local => Ok(()),
            Route::Remote(group) => match group.nodes.first() {
                Some(node) => Err(RaftError::Moved {
                    slot,
                    addr: node.addr.clone(),
                }),
                None => Err(RaftError::ClusterDown),
            },
            Route::Unassigned => Err(RaftError::ClusterDown),
        }
    }

    // ----------------------------------------------------------------------
    // Cluster lifecycle

    fn cluster_init(&mut self) -> Result<String> {
        match self.cluster_state {
            ClusterState::Uninitialized => {}
            ClusterState::Loading => return Err(RaftError::Loading),
            ClusterState::Joining => return Err(RaftError::JoinInProgress),
            ClusterState::Up | ClusterState::Down => {
                return Err(RaftError::ClusterAlreadyInitialized)
            }
        }
        let node_id = match self.core.id() {
            0 => UsedNodeIds::new().allocate(),
            id => id,
        };
        let dbid = generate_dbid();
        self.core.set_identity(node_id, dbid.clone())?;
        self.core
            .bootstrap(dbid.clone(), &[(node_id, self.config.public_addr())])?;
        self.cluster_state = ClusterState::Up;
        tracing::info!(node_id, dbid = %dbid, "Initialized new cluster");
        Ok(dbid)
    }

    fn cluster_join(&mut self, addrs: Vec<String>, response_tx: oneshot::Sender<Result<()>>) {
        let refused = match self.cluster_state {
            ClusterState::Uninitialized => None,
            ClusterState::Loading => Some(RaftError::Loading),
            ClusterState::Joining => Some(RaftError::JoinInProgress),
            ClusterState::Up | ClusterState::Down => Some(RaftError::ClusterAlreadyInitialized),
        };
        if let Some(err) = refused {
            let _ = response_tx.send(Err(err));
            return;
        }

        tracing::info!(node_id = self.core.id(), addrs = ?addrs, "Joining cluster");
        self.cluster_state = ClusterState::Joining;
        self.join_tx = Some(response_tx);

        let transport = self.transport.clone();
        let message_tx = self.message_tx.clone();
        let node_id = self.core.id();
        let public_addr = self.config.public_addr();
        let backoff = JoinBackoff {
            initial: Duration::from_millis(self.config.join_retry_ms),
            max: Duration::from_millis(self.config.join_retry_max_ms),
        };
        let cancel = self.background.child_token();
        tokio::spawn(async move {
            let result = join_cluster(transport, addrs, node_id, public_addr, backoff, cancel).await;
            let _ = message_tx.send(RaftMessage::Joined { result }).await;
        });
    }

    fn on_joined(&mut self, result: Result<AddNodeReply>) {
        if self.cluster_state != ClusterState::Joining {
            return;
        }
        let outcome = match result {
            Ok(reply) => {
                let assigned = self.core.set_identity(reply.node_id, reply.dbid);
                if assigned.is_ok() {
                    self.cluster_state = ClusterState::Up;
                }
                assigned
            }
            Err(e) => {
                self.cluster_state = ClusterState::Uninitialized;
                Err(e)
            }
        };
        if let Some(tx) = self.join_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    fn add_node(
        &mut self,
        correlation_id: CorrelationId,
        node_id: NodeId,
        addr: String,
        response_tx: oneshot::Sender<Result<AddNodeReply>>,
    ) {
        if let Err(e) = self.check_up() {
            let _ = response_tx.send(Err(e));
            return;
        }
        let dbid = self.core.dbid().unwrap_or_default().to_string();

        // A retried join finds itself already admitted.
        let existing = self
            .core
            .membership()
            .nodes()
            .find(|n| n.addr == addr && (node_id == 0 || n.id == node_id))
            .map(|n| n.id);
        if let Some(node_id) = existing.filter(|_| self.core.is_leader()) {
            let _ = response_tx.send(Ok(AddNodeReply { node_id, dbid }));
            return;
        }

        match self.core.add_node(node_id, &addr) {
            Ok((index, term, _)) => self.pending.insert(
                index,
                term,
                correlation_id,
                None,
                Completion::AddNode { dbid, response_tx },
            ),
            Err(e) => {
                let _ = response_tx.send(Err(self.availability(e)));
            }
        }
    }

    // ----------------------------------------------------------------------
    // Shard groups

    fn local_shard_group(&self) -> Result<ShardGroup> {
        self.check_up()?;
        self.check_sharding()?;
        let dbid = self.core.dbid().ok_or(RaftError::NoCluster)?;
        let (start_slot, end_slot) = self.local_range();
        Ok(ShardGroup {
            id: dbid.to_string(),
            start_slot,
            end_slot,
            nodes: self
                .core
                .membership()
                .nodes()
                .map(|n| ShardGroupNode {
                    id: n.id,
                    addr: n.addr.clone(),
                })
                .collect(),
        })
    }

    fn propose_shard_group(
        &mut self,
        correlation_id: CorrelationId,
        group: ShardGroup,
        update: bool,
        response_tx: oneshot::Sender<Result<()>>,
    ) {
        let local = self.local_range();
        let result = self
            .check_up()
            .and_then(|_| self.check_sharding())
            .and_then(|_| self.core.propose_shard_group(&group, update, local));
        match result {
            Ok((index, term)) => {
                tracing::info!(node_id = self.core.id(), group = %group.id, update, index, "Proposed shard group");
                self.pending.insert(
                    index,
                    term,
                    correlation_id,
                    None,
                    Completion::Done(response_tx),
                );
            }
            Err(e) => {
                let _ = response_tx.send(Err(self.availability(e)));
            }
        }
    }

    fn shard_group_link(
        &mut self,
        correlation_id: CorrelationId,
        addr: String,
        response_tx: oneshot::Sender<Result<()>>,
    ) {
        let ready = self.check_up().and_then(|_| self.check_sharding()).and_then(|_| {
            if self.core.is_leader() {
                Ok(())
            } else {
                Err(self.availability(RaftError::NotLeader {
                    leader_id: self.core.leader_id(),
                    leader_addr: self.core.leader_addr(),
                }))
            }
        });
        if let Err(e) = ready {
            let _ = response_tx.send(Err(e));
            return;
        }

        tracing::info!(node_id = self.core.id(), addr = %addr, "Linking shard group");
        let transport = self.transport.clone();
        let message_tx = self.message_tx.clone();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        tokio::spawn(async move {
            let result = with_timeout(timeout, transport.shard_group_get(&addr)).await;
            let _ = message_tx
                .send(RaftMessage::ShardGroupFetched {
                    correlation_id,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    // ----------------------------------------------------------------------
    // Snapshots

    /// Captures a snapshot and writes it in the background after `delay`.
    fn start_snapshot(&mut self, delay: Duration) -> Result<LogIndex> {
        let job = self.core.begin_snapshot()?;
        let index = job.index;
        let message_tx = self.message_tx.clone();
        let cancel = self.background.child_token();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let result = tokio::task::spawn_blocking(move || job.write())
                .await
                .unwrap_or_else(|e| Err(SnapshotError::Io(e.to_string())));
            let _ = message_tx
                .send(RaftMessage::SnapshotWritten { index, result })
                .await;
        });
        Ok(index)
    }
}

/// Bounds a peer call; an elapsed deadline reads as `Timeout`.
async fn with_timeout<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RaftError::Timeout))
}
