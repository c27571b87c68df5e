use thiserror::Error;

use crate::raft::log::LogError;
use crate::raft::snapshot::SnapshotError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    // Protocol
    #[error("ERR invalid or incorrect target node id (expected {expected}, got {got})")]
    InvalidTarget { expected: u64, got: u64 },

    #[error("ERR malformed message: {0}")]
    Malformed(String),

    // Availability
    #[error("NOCLUSTER No Raft Cluster")]
    NoCluster,

    #[error("LOADING Raft module loading")]
    Loading,

    #[error("CLUSTERDOWN No raft leader")]
    ClusterDown,

    #[error("NOTLEADER {} {}", .leader_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()), .leader_addr.as_deref().unwrap_or("-"))]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    // Validation
    #[error("ERR invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ERR invalid node id {0}")]
    InvalidNodeId(u64),

    #[error("ERR invalid address '{0}'")]
    InvalidAddress(String),

    #[error("ERR cannot transfer leadership to self")]
    TransferToSelf,

    #[error("ERR node id {0} is already in use")]
    DuplicateNodeId(u64),

    #[error("ERR unknown node {0}")]
    UnknownNode(u64),

    #[error("ERR already cluster member")]
    ClusterAlreadyInitialized,

    #[error("ERR node is already joining a cluster")]
    JoinInProgress,

    #[error("ERR sharding not enabled")]
    ShardingDisabled,

    #[error("ERR shard group conflict: {0}")]
    ShardGroupConflict(String),

    // In-flight outcome
    #[error("ERR a configuration change is already in progress")]
    ConfigChangeInProgress,

    #[error("ERR leadership transfer in progress")]
    TransferInProgress,

    #[error("ERR leadership transfer failed: {0}")]
    TransferFailed(String),

    #[error("ERR leadership went to unexpected node {0}")]
    UnexpectedLeader(u64),

    #[error("ERR entry was discarded by a new leader")]
    Discarded,

    #[error("TIMEOUT request timed out")]
    Timeout,

    #[error("ERR request cancelled")]
    Cancelled,

    #[error("ERR node is shutting down")]
    Shutdown,

    // Transient
    #[error("ERR transport: {0}")]
    Transport(String),

    // Fatal
    #[error("ERR log store: {0}")]
    Log(#[from] LogError),

    #[error("ERR snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("ERR fatal: {0}")]
    Fatal(String),
}

impl RaftError {
    /// Errors after which the node must stop participating in consensus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Fatal(_) | RaftError::Log(LogError::Io(_)) | RaftError::Log(LogError::Corrupt(_))
        )
    }

    /// Converts into a gRPC status, keeping the status token as the message prefix.
    pub fn to_status(&self) -> tonic::Status {
        let message = self.to_string();
        match self {
            RaftError::NoCluster
            | RaftError::Loading
            | RaftError::ClusterDown
            | RaftError::Shutdown
            | RaftError::Transport(_) => tonic::Status::unavailable(message),
            RaftError::NotLeader { .. } | RaftError::Moved { .. } => {
                tonic::Status::failed_precondition(message)
            }
            RaftError::Timeout => tonic::Status::deadline_exceeded(message),
            RaftError::Cancelled => tonic::Status::cancelled(message),
            RaftError::Log(_) | RaftError::Snapshot(_) | RaftError::Fatal(_) => {
                tonic::Status::internal(message)
            }
            _ => tonic::Status::invalid_argument(message),
        }
    }

    /// Rebuilds a typed error from a status produced by [`RaftError::to_status`].
    ///
    /// Variants that carry no routing information degrade to `Transport`.
    pub fn from_status(status: &tonic::Status) -> Self {
        let message = status.message();
        let mut words = message.split_whitespace();
        match words.next() {
            Some("NOCLUSTER") => RaftError::NoCluster,
            Some("LOADING") => RaftError::Loading,
            Some("CLUSTERDOWN") => RaftError::ClusterDown,
            Some("TIMEOUT") => RaftError::Timeout,
            Some("NOTLEADER") => {
                let leader_id = words.next().and_then(|w| w.parse().ok());
                let leader_addr = words.next().filter(|w| *w != "-").map(str::to_string);
                RaftError::NotLeader {
                    leader_id,
                    leader_addr,
                }
            }
            Some("MOVED") => {
                let slot = words.next().and_then(|w| w.parse().ok());
                let addr = words.next();
                match (slot, addr) {
                    (Some(slot), Some(addr)) => RaftError::Moved {
                        slot,
                        addr: addr.to_string(),
                    },
                    _ => RaftError::Transport(message.to_string()),
                }
            }
            Some("ERR") => Self::from_err_message(message),
            _ => RaftError::Transport(message.to_string()),
        }
    }

    /// Recovers the validation errors a joining node must not retry.
    fn from_err_message(message: &str) -> Self {
        let rest = message.trim_start_matches("ERR ");
        if let Some(id) = rest
            .strip_prefix("node id ")
            .and_then(|r| r.strip_suffix(" is already in use"))
            .and_then(|id| id.parse().ok())
        {
            return RaftError::DuplicateNodeId(id);
        }
        if let Some(id) = rest
            .strip_prefix("invalid node id ")
            .and_then(|id| id.parse().ok())
        {
            return RaftError::InvalidNodeId(id);
        }
        if let Some(addr) = rest
            .strip_prefix("invalid address '")
            .and_then(|r| r.strip_suffix('\''))
        {
            return RaftError::InvalidAddress(addr.to_string());
        }
        match rest {
            "a configuration change is already in progress" => RaftError::ConfigChangeInProgress,
            "sharding not enabled" => RaftError::ShardingDisabled,
            "already cluster member" => RaftError::ClusterAlreadyInitialized,
            "cannot transfer leadership to self" => RaftError::TransferToSelf,
            _ => RaftError::Transport(message.to_string()),
        }
    }
}

impl From<tonic::Status> for RaftError {
    fn from(status: tonic::Status) -> Self {
        RaftError::from_status(&status)
    }
}

impl From<tonic::transport::Error> for RaftError {
    fn from(err: tonic::transport::Error) -> Self {
        RaftError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_redirect() {
        let err = RaftError::NotLeader {
            leader_id: Some(3),
            leader_addr: Some("127.0.0.1:7003".to_string()),
        };
        assert_eq!(RaftError::from_status(&err.to_status()), err);

        let err = RaftError::NotLeader {
            leader_id: None,
            leader_addr: None,
        };
        assert_eq!(RaftError::from_status(&err.to_status()), err);
    }

    #[test]
    fn test_status_round_trip_availability() {
        for err in [RaftError::NoCluster, RaftError::Loading, RaftError::ClusterDown] {
            assert_eq!(RaftError::from_status(&err.to_status()), err);
        }
        let moved = RaftError::Moved {
            slot: 42,
            addr: "10.0.0.1:5000".to_string(),
        };
        assert_eq!(RaftError::from_status(&moved.to_status()), moved);
    }

    #[test]
    fn test_status_round_trip_join_rejections() {
        for err in [
            RaftError::DuplicateNodeId(7),
            RaftError::InvalidNodeId(0),
            RaftError::InvalidAddress("nohost".to_string()),
            RaftError::ConfigChangeInProgress,
            RaftError::ShardingDisabled,
        ] {
            assert_eq!(RaftError::from_status(&err.to_status()), err);
        }
        assert!(matches!(
            RaftError::from_status(&RaftError::UnknownNode(4).to_status()),
            RaftError::Transport(_)
        ));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RaftError::Log(LogError::Io("disk full".into())).is_fatal());
        assert!(!RaftError::Log(LogError::IndexOutOfRange(5)).is_fatal());
        assert!(!RaftError::ClusterDown.is_fatal());
    }
}
