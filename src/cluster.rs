//! Cluster lifecycle helpers: address validation, cluster ids and the join loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{RaftError, Result};
use crate::raft::pending::AddNodeReply;
use crate::raft::state::NodeId;
use crate::transport::RaftTransport;

/// Redirects followed per seed address before moving on to the next one.
const MAX_REDIRECTS: usize = 3;

/// Checks that `addr` is a `host:port` pair.
pub fn validate_addr(addr: &str) -> Result<()> {
    let invalid = || RaftError::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

/// A fresh cluster identifier.
pub fn generate_dbid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Retry policy for [`join_cluster`].
#[derive(Debug, Clone, Copy)]
pub struct JoinBackoff {
    pub initial: Duration,
    pub max: Duration,
}

/// Asks the nodes at `addrs`, in order, to admit this node until one accepts.
///
/// `NotLeader` answers are followed to the leader. Failures back off
/// exponentially between passes over the address list. Only validation
/// errors from the cluster (duplicate id, bad address) end the loop early.
pub async fn join_cluster(
    transport: Arc<dyn RaftTransport>,
    addrs: Vec<String>,
    node_id: NodeId,
    public_addr: String,
    backoff: JoinBackoff,
    cancel: CancellationToken,
) -> Result<AddNodeReply> {
    let mut delay = backoff.initial;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        for seed in &addrs {
            let mut target = seed.clone();
            for _ in 0..=MAX_REDIRECTS {
                if cancel.is_cancelled() {
                    return Err(RaftError::Cancelled);
                }
                match transport.add_node(&target, node_id, &public_addr).await {
                    Ok(reply) => {
                        tracing::info!(
                            node_id = reply.node_id,
                            dbid = %reply.dbid,
                            via = %target,
                            "Joined cluster"
                        );
                        return Ok(reply);
                    }
                    Err(RaftError::NotLeader {
                        leader_addr: Some(leader),
                        ..
                    }) if leader != target => {
                        tracing::debug!(from = %target, to = %leader, "Join redirected to leader");
                        target = leader;
                    }
                    Err(
                        err @ (RaftError::DuplicateNodeId(_)
                        | RaftError::InvalidAddress(_)
                        | RaftError::InvalidNodeId(_)),
                    ) => {
                        tracing::warn!(addr = %target, error = %err, "Join rejected");
                        return Err(err);
                    }
                    Err(err) => {
                        tracing::debug!(addr = %target, attempt, error = %err, "Join attempt failed");
                        break;
                    }
                }
            }
        }

        tracing::warn!(
            attempt,
            retry_ms = delay.as_millis() as u64,
            "Could not join cluster, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RaftError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(backoff.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_addr() {
        assert!(validate_addr("127.0.0.1:5001").is_ok());
        assert!(validate_addr("node-1.internal:80").is_ok());
        assert!(validate_addr("[::1]:5001").is_ok());

        for bad in ["", "localhost", ":5001", "host:", "host:0", "host:99999", "a b:1"] {
            assert_eq!(
                validate_addr(bad),
                Err(RaftError::InvalidAddress(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_generate_dbid() {
        let a = generate_dbid();
        let b = generate_dbid();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
