pub mod core;
pub mod handle;
pub mod log;
pub mod membership;
pub mod node;
pub mod pending;
pub mod rpc;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod timer;

pub use self::core::{RaftCore, Timing};
pub use handle::{ClusterState, NodeInfo, RaftHandle};
pub use log::{LogStore, MemoryLog};
pub use membership::{ConnectionState, Node, NodeRole};
pub use node::{RaftMessage, RaftNode};
pub use state::{EntryKind, LogEntry, LogIndex, NodeId, RaftRole, Term};
pub use storage::FileLog;
