use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::shard::SLOT_COUNT;

/// Shard-group routing settings.
///
/// When disabled, every shard-group operation is refused and client
/// commands are never redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub enabled: bool,
    /// First hash slot owned by this group (inclusive).
    pub start_slot: u16,
    /// Last hash slot owned by this group (inclusive).
    pub end_slot: u16,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_slot: 0,
            end_slot: SLOT_COUNT - 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Requested node id; 0 lets the cluster pick one.
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    /// Address peers use to reach this node (host:port). Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    /// Directory for the persistent log; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub tick_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Number of applied entries past the last snapshot that triggers a new one.
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
    pub transfer_timeout_ms: u64,
    pub join_retry_ms: u64,
    pub join_retry_max_ms: u64,
    pub sharding: ShardingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            advertise_addr: None,
            data_dir: None,
            tick_interval_ms: 10,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            request_timeout_ms: 5000,
            snapshot_threshold: 1000,
            snapshot_chunk_size: 64 * 1024,
            transfer_timeout_ms: 1000,
            join_retry_ms: 250,
            join_retry_max_ms: 5000,
            sharding: ShardingConfig::default(),
        }
    }
}

/// Names accepted by [`NodeConfig::get`] and [`NodeConfig::set`].
const PARAMETERS: &[&str] = &[
    "election-timeout-min",
    "election-timeout-max",
    "heartbeat-interval",
    "rpc-timeout",
    "request-timeout",
    "snapshot-threshold",
    "snapshot-chunk-size",
    "transfer-timeout",
    "join-retry",
    "join-retry-max",
    "sharding",
    "slot-config",
];

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    pub fn with_sharding(mut self, start_slot: u16, end_slot: u16) -> Self {
        self.sharding = ShardingConfig {
            enabled: true,
            start_slot,
            end_slot,
        };
        self
    }

    /// The address other nodes should dial.
    pub fn public_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(RaftError::InvalidArgument(
                "tick interval must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::InvalidArgument(
                "election timeout min exceeds max".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RaftError::InvalidArgument(
                "heartbeat interval must be shorter than the election timeout".to_string(),
            ));
        }
        if self.snapshot_chunk_size == 0 {
            return Err(RaftError::InvalidArgument(
                "snapshot chunk size must be positive".to_string(),
            ));
        }
        if let Some(addr) = &self.advertise_addr {
            crate::cluster::validate_addr(addr)?;
        }
        let sharding = &self.sharding;
        if sharding.start_slot > sharding.end_slot || sharding.end_slot >= SLOT_COUNT {
            return Err(RaftError::InvalidArgument(format!(
                "invalid slot range {}-{}",
                sharding.start_slot, sharding.end_slot
            )));
        }
        Ok(())
    }

    /// Returns every runtime parameter whose name matches `pattern`.
    ///
    /// `*` matches any run of characters.
    pub fn get(&self, pattern: &str) -> Vec<(String, String)> {
        PARAMETERS
            .iter()
            .filter(|name| glob_match(pattern, name))
            .filter_map(|name| self.value_of(name).map(|v| (name.to_string(), v)))
            .collect()
    }

    fn value_of(&self, name: &str) -> Option<String> {
        let value = match name {
            "election-timeout-min" => self.election_timeout_min_ms.to_string(),
            "election-timeout-max" => self.election_timeout_max_ms.to_string(),
            "heartbeat-interval" => self.heartbeat_interval_ms.to_string(),
            "rpc-timeout" => self.rpc_timeout_ms.to_string(),
            "request-timeout" => self.request_timeout_ms.to_string(),
            "snapshot-threshold" => self.snapshot_threshold.to_string(),
            "snapshot-chunk-size" => self.snapshot_chunk_size.to_string(),
            "transfer-timeout" => self.transfer_timeout_ms.to_string(),
            "join-retry" => self.join_retry_ms.to_string(),
            "join-retry-max" => self.join_retry_max_ms.to_string(),
            "sharding" => (if self.sharding.enabled { "yes" } else { "no" }).to_string(),
            "slot-config" => format!("{}:{}", self.sharding.start_slot, self.sharding.end_slot),
            _ => return None,
        };
        Some(value)
    }

    /// Updates a single runtime parameter. The change is validated as a whole
    /// and rolled back if it leaves the config inconsistent.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match name {
            "election-timeout-min" => updated.election_timeout_min_ms = parse_num(name, value)?,
            "election-timeout-max" => updated.election_timeout_max_ms = parse_num(name, value)?,
            "heartbeat-interval" => updated.heartbeat_interval_ms = parse_num(name, value)?,
            "rpc-timeout" => updated.rpc_timeout_ms = parse_num(name, value)?,
            "request-timeout" => updated.request_timeout_ms = parse_num(name, value)?,
            "snapshot-threshold" => updated.snapshot_threshold = parse_num(name, value)?,
            "snapshot-chunk-size" => updated.snapshot_chunk_size = parse_num(name, value)?,
            "transfer-timeout" => updated.transfer_timeout_ms = parse_num(name, value)?,
            "join-retry" => updated.join_retry_ms = parse_num(name, value)?,
            "join-retry-max" => updated.join_retry_max_ms = parse_num(name, value)?,
            "sharding" => {
                updated.sharding.enabled = match value.to_ascii_lowercase().as_str() {
                    "yes" | "true" | "1" => true,
                    "no" | "false" | "0" => false,
                    _ => return Err(invalid_value(name, value)),
                }
            }
            "slot-config" => {
                let (start, end) = value
                    .split_once(':')
                    .ok_or_else(|| invalid_value(name, value))?;
                updated.sharding.start_slot = parse_num(name, start)?;
                updated.sharding.end_slot = parse_num(name, end)?;
            }
            _ => {
                return Err(RaftError::InvalidArgument(format!(
                    "unknown config parameter '{name}'"
                )))
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid_value(name, value))
}

fn invalid_value(name: &str, value: &str) -> RaftError {
    RaftError::InvalidArgument(format!("invalid value '{value}' for '{name}'"))
}

fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            if !name.starts_with(prefix) {
                return false;
            }
            let tail = &name[prefix.len()..];
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|i| tail.is_char_boundary(*i))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 0);
        assert_eq!(config.election_timeout_min_ms, 150);
        assert_eq!(config.election_timeout_max_ms, 300);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert!(config.data_dir.is_none());
        assert!(!config.sharding.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_public_addr_prefers_advertised() {
        let addr: SocketAddr = "0.0.0.0:7001".parse().unwrap();
        let config = NodeConfig::new(1, addr);
        assert_eq!(config.public_addr(), "0.0.0.0:7001");

        let config = config.with_advertise_addr("node1.internal:7001");
        assert_eq!(config.public_addr(), "node1.internal:7001");
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let mut config = NodeConfig::default();
        config.heartbeat_interval_ms = 200;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.election_timeout_min_ms = 400;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_slot_range() {
        let config = NodeConfig::default().with_sharding(100, 50);
        assert!(config.validate().is_err());

        let config = NodeConfig::default().with_sharding(0, SLOT_COUNT);
        assert!(config.validate().is_err());

        let config = NodeConfig::default().with_sharding(0, 8191);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_get_with_glob() {
        let config = NodeConfig::default();
        let all = config.get("*");
        assert_eq!(all.len(), PARAMETERS.len());

        let timeouts = config.get("*timeout*");
        let names: Vec<_> = timeouts.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"election-timeout-min"));
        assert!(names.contains(&"request-timeout"));
        assert!(!names.contains(&"heartbeat-interval"));

        let exact = config.get("heartbeat-interval");
        assert_eq!(exact, vec![("heartbeat-interval".to_string(), "50".to_string())]);
    }

    #[test]
    fn test_set_updates_and_validates() {
        let mut config = NodeConfig::default();
        config.set("snapshot-threshold", "10").unwrap();
        assert_eq!(config.snapshot_threshold, 10);

        config.set("slot-config", "0:4095").unwrap();
        assert_eq!(config.sharding.start_slot, 0);
        assert_eq!(config.sharding.end_slot, 4095);

        config.set("sharding", "yes").unwrap();
        assert!(config.sharding.enabled);

        // Heartbeat longer than the election timeout is rejected and not applied
        assert!(config.set("heartbeat-interval", "1000").is_err());
        assert_eq!(config.heartbeat_interval_ms, 50);

        assert!(config.set("no-such-param", "1").is_err());
        assert!(config.set("rpc-timeout", "abc").is_err());
    }
}
