pub mod cluster;
pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod proto;
pub mod raft;
pub mod shard;
pub mod shutdown;
pub mod statemachine;
pub mod transport;

pub use config::{NodeConfig, ShardingConfig};
pub use error::{RaftError, Result};
pub use raft::{ClusterState, NodeInfo, RaftHandle, RaftNode};
pub use statemachine::{CommandBatch, KvStateMachine, StateMachine};
