//! Test harness for multi-node Raft cluster integration tests.
//!
//! Nodes talk over an in-process [`LocalNetwork`], so partitions are exact
//! and no ports are needed. Every cluster is formed the way an operator
//! would: node 1 runs `ClusterInit`, the others `ClusterJoin` through it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shardraft::config::NodeConfig;
use shardraft::error::RaftError;
use shardraft::raft::{ClusterState, NodeInfo, NodeRole, RaftHandle, RaftNode, RaftRole};
use shardraft::statemachine::{KvReader, KvStateMachine};
use shardraft::transport::LocalNetwork;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Address node `id` advertises on the local network.
pub fn node_addr(id: u64) -> String {
    format!("node-{id}:7000")
}

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64) -> NodeConfig {
    let mut config = NodeConfig::default().with_advertise_addr(node_addr(node_id));
    config.node_id = node_id;
    config.tick_interval_ms = 5;
    config.election_timeout_min_ms = 60;
    config.election_timeout_max_ms = 120;
    config.heartbeat_interval_ms = 15;
    config.rpc_timeout_ms = 50;
    config.request_timeout_ms = 3000;
    config.transfer_timeout_ms = 500;
    config.join_retry_ms = 20;
    config.join_retry_max_ms = 200;
    config
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub addr: String,
    pub config: NodeConfig,
    pub handle: RaftHandle,
    pub kv: KvReader,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestNode {
    pub fn info(&self) -> NodeInfo {
        self.handle.info()
    }

    pub fn is_leader(&self) -> bool {
        let info = self.info();
        info.cluster_state == ClusterState::Up && info.role == RaftRole::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.info().term
    }

    pub fn commit_index(&self) -> u64 {
        self.info().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.info().last_applied
    }

    pub fn role(&self) -> RaftRole {
        self.info().role
    }

    /// Stops the node and waits for its loop to exit.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: BTreeMap<u64, TestNode>,
}

impl TestCluster {
    /// An empty cluster with no nodes started.
    pub fn empty() -> Self {
        Self {
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Create and start a cluster with n voting nodes
    pub async fn new(num_nodes: u64) -> Self {
        Self::with_configs((1..=num_nodes).map(test_node_config).collect()).await
    }

    /// Forms a cluster from explicit configs; the first one initializes it.
    pub async fn with_configs(configs: Vec<NodeConfig>) -> Self {
        Self::on_network(LocalNetwork::new(), configs).await
    }

    /// Like [`TestCluster::with_configs`], sharing `network` with other clusters.
    pub async fn on_network(network: Arc<LocalNetwork>, configs: Vec<NodeConfig>) -> Self {
        let mut cluster = Self {
            network,
            nodes: BTreeMap::new(),
        };
        let mut configs = configs.into_iter();
        let Some(first) = configs.next() else {
            return cluster;
        };

        let first_id = first.node_id;
        cluster.start_node(first);
        cluster
            .node(first_id)
            .handle
            .cluster_init()
            .await
            .expect("cluster init should succeed");
        cluster
            .wait_for_leader(TIMEOUT)
            .await
            .expect("first node should lead");

        for config in configs {
            let id = config.node_id;
            cluster.add_node(config).await;
            cluster
                .wait_for_voter(id, TIMEOUT)
                .await
                .unwrap_or_else(|| panic!("node {id} should become a voter"));
        }
        cluster
    }

    /// Starts a node that is not yet part of any cluster.
    pub fn start_node(&mut self, config: NodeConfig) -> &TestNode {
        let kv = KvStateMachine::new();
        let reader = kv.reader();
        let addr = config.public_addr();
        let transport = Arc::new(self.network.transport(addr.clone()));
        let (raft, raft_rx) =
            RaftNode::new(config.clone(), Box::new(kv), transport).expect("valid test config");
        let handle = raft.handle();
        self.network.register(addr.clone(), handle.clone());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(raft.run(raft_rx, shutdown.clone()));
        let node_id = config.node_id;
        self.nodes.insert(
            node_id,
            TestNode {
                node_id,
                addr,
                config,
                handle,
                kv: reader,
                shutdown,
                task,
            },
        );
        self.node(node_id)
    }

    /// Starts a node and joins it through the current members.
    pub async fn add_node(&mut self, config: NodeConfig) {
        let seeds: Vec<String> = self.nodes.values().map(|n| n.addr.clone()).collect();
        let id = config.node_id;
        self.start_node(config);
        self.node(id)
            .handle
            .cluster_join(seeds)
            .await
            .unwrap_or_else(|e| panic!("node {id} should join: {e}"));
    }

    /// Stops a node (simulates a crash) and returns its config for a restart.
    pub async fn stop_node(&mut self, node_id: u64) -> Option<NodeConfig> {
        let node = self.nodes.remove(&node_id)?;
        self.network.unregister(&node.addr);
        let config = node.config.clone();
        node.stop().await;
        Some(config)
    }

    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    pub fn node(&self, node_id: u64) -> &TestNode {
        self.nodes
            .get(&node_id)
            .unwrap_or_else(|| panic!("node {node_id} is not running"))
    }

    pub fn active_node_ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }

    /// Leaders of the highest term currently observed.
    pub fn get_leader_id(&self) -> Option<u64> {
        self.nodes
            .values()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.current_term())
            .map(|n| n.node_id)
    }

    pub fn count_leaders(&self) -> usize {
        self.nodes.values().filter(|n| n.is_leader()).count()
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let elected = wait_for(
            || async { self.get_leader_id().is_some() },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await;
        if elected {
            self.get_leader_id()
        } else {
            None
        }
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<u64> {
        let find = || {
            group
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .filter(|n| n.is_leader())
                .max_by_key(|n| n.current_term())
                .map(|n| n.node_id)
        };
        let elected = wait_for(
            || async { find().is_some() },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await;
        if elected {
            find()
        } else {
            None
        }
    }

    /// Waits until the leader reports `node_id` as a voting member.
    pub async fn wait_for_voter(&self, node_id: u64, timeout_duration: Duration) -> Option<()> {
        let promoted = wait_for(
            || async {
                self.get_leader_id().is_some_and(|leader| {
                    self.node(leader)
                        .info()
                        .nodes
                        .iter()
                        .any(|n| n.id == node_id && n.role == NodeRole::Voting)
                })
            },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await;
        promoted.then_some(())
    }

    /// Submits through whichever node currently leads, retrying redirects.
    pub async fn submit(&self, ops: &[&str]) -> Result<Vec<String>, RaftError> {
        let ops: Vec<Vec<u8>> = ops.iter().map(|op| op.as_bytes().to_vec()).collect();
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let result = match self.get_leader_id() {
                Some(leader) => self.node(leader).handle.submit(ops.clone(), None).await,
                None => Err(RaftError::ClusterDown),
            };
            match result {
                Ok(replies) => {
                    return Ok(replies
                        .into_iter()
                        .map(|r| String::from_utf8_lossy(&r).into_owned())
                        .collect())
                }
                Err(RaftError::NotLeader { .. } | RaftError::ClusterDown | RaftError::Discarded)
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submits directly to one node, without redirects.
    pub async fn submit_to_node(&self, node_id: u64, op: &str) -> Result<String, RaftError> {
        let replies = self
            .node(node_id)
            .handle
            .submit(vec![op.as_bytes().to_vec()], None)
            .await?;
        Ok(replies
            .first()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_default())
    }

    /// Waits until every running node has applied at least `index`.
    pub async fn wait_for_applied_on_all(&self, index: u64, timeout_duration: Duration) -> bool {
        let ids = self.active_node_ids();
        self.wait_for_applied_on_nodes(&ids, index, timeout_duration)
            .await
    }

    pub async fn wait_for_applied_on_nodes(
        &self,
        node_ids: &[u64],
        index: u64,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                node_ids.iter().all(|id| {
                    self.nodes
                        .get(id)
                        .is_some_and(|n| n.last_applied() >= index)
                })
            },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await
    }

    /// Waits until `key` reads `value` on every running node.
    pub async fn wait_for_key_on_all(&self, key: &str, value: &str, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                self.nodes
                    .values()
                    .all(|n| n.kv.get(key).as_deref() == Some(value))
            },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        let addrs = |ids: &[u64]| -> Vec<String> { ids.iter().map(|id| node_addr(*id)).collect() };
        self.network.partition(&addrs(group_a), &addrs(group_b));
    }

    /// Isolate a node from all other nodes
    pub fn isolate_node(&self, node_id: u64) {
        self.network.isolate(&node_addr(node_id));
    }

    pub fn heal(&self) {
        self.network.heal();
    }
}

/// A config whose log lives in `dir`.
pub fn persistent_config(node_id: u64, dir: impl Into<PathBuf>) -> NodeConfig {
    test_node_config(node_id).with_data_dir(dir)
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
