//! The replicated state machine interface and a small key/value executor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::LogIndex;

/// The ordered operations of one client request, stored as a single log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBatch {
    pub ops: Vec<Vec<u8>>,
}

impl CommandBatch {
    pub fn new(ops: Vec<Vec<u8>>) -> Self {
        Self { ops }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RaftError::Malformed(e.to_string()))
    }
}

/// Deterministic executor for committed command batches.
///
/// Owned by the consensus core and only ever called from its task, so
/// implementations need no internal synchronisation.
pub trait StateMachine: Send + 'static {
    /// Executes every op of a committed batch, returning one reply per op.
    fn apply(&mut self, index: LogIndex, batch: &CommandBatch) -> Vec<Vec<u8>>;

    /// Serialises the full state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the full state with a snapshot image.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Read-only view of a [`KvStateMachine`], usable from other tasks.
#[derive(Debug, Clone, Default)]
pub struct KvReader {
    data: Arc<Mutex<KvData>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KvData {
    entries: BTreeMap<String, String>,
    last_index: LogIndex,
}

impl KvReader {
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the last entry applied (or restored from a snapshot).
    pub fn last_index(&self) -> LogIndex {
        self.lock().last_index
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvData> {
        // A poisoned lock only means a reader panicked; the data is intact.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Key/value executor for whitespace-separated text ops:
/// `SET key value`, `GET key`, `DEL key`.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    view: KvReader,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> KvReader {
        self.view.clone()
    }

    fn execute(data: &mut KvData, op: &[u8]) -> String {
        let text = String::from_utf8_lossy(op);
        let mut parts = text.split_whitespace();
        let command = parts.next().map(str::to_ascii_uppercase);
        match (command.as_deref(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                let rest: Vec<&str> = std::iter::once(value).chain(parts).collect();
                data.entries.insert(key.to_string(), rest.join(" "));
                "OK".to_string()
            }
            (Some("GET"), Some(key), None) => data
                .entries
                .get(key)
                .cloned()
                .unwrap_or_else(|| "(nil)".to_string()),
            (Some("DEL"), Some(key), None) => {
                let removed = data.entries.remove(key).is_some();
                (if removed { "1" } else { "0" }).to_string()
            }
            _ => format!("ERR unknown command '{text}'"),
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, batch: &CommandBatch) -> Vec<Vec<u8>> {
        let mut data = self.view.lock();
        data.last_index = index;
        batch
            .ops
            .iter()
            .map(|op| Self::execute(&mut data, op).into_bytes())
            .collect()
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&*self.view.lock()).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        let restored: KvData = serde_json::from_slice(data)
            .map_err(|e| RaftError::Malformed(format!("snapshot state: {e}")))?;
        *self.view.lock() = restored;
        Ok(())
    }
}
