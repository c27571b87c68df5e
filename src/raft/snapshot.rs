//! Snapshot creation, persistence and chunked transfer.
//!
//! A snapshot image bundles the state machine bytes with the cluster metadata
//! that must survive log compaction (membership, used node ids, shard table).
//! The encoded image is what travels in InstallSnapshot chunks and what is
//! stored in `snapshot.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::membership::{Membership, UsedNodeIds};
use crate::raft::state::{LogIndex, Term};
use crate::raft::storage::write_bytes_atomic;
use crate::shard::ShardingTable;

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot already in progress")]
    InProgress,

    /// The transfer must restart from offset 0.
    #[error("corrupt snapshot chunk: {0}")]
    CorruptChunk(String),

    #[error("no snapshot available")]
    NotFound,

    #[error("snapshot I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub used_node_ids: UsedNodeIds,
    pub membership: Membership,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub info: SnapshotInfo,
    pub shards: ShardingTable,
    pub state: Vec<u8>,
    checksum: u32,
}

impl SnapshotImage {
    pub fn new(info: SnapshotInfo, shards: ShardingTable, state: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&state);
        Self {
            info,
            shards,
            state,
            checksum,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let image: SnapshotImage = serde_json::from_slice(bytes)
            .map_err(|e| SnapshotError::CorruptChunk(e.to_string()))?;
        let actual = crc32fast::hash(&image.state);
        if actual != image.checksum {
            return Err(SnapshotError::CorruptChunk(format!(
                "checksum mismatch: expected {:08x}, got {actual:08x}",
                image.checksum
            )));
        }
        Ok(image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    pub last_chunk: bool,
}

/// A snapshot that can be served to followers.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub info: SnapshotInfo,
    bytes: Arc<Vec<u8>>,
}

impl StoredSnapshot {
    fn new(info: SnapshotInfo, bytes: Vec<u8>) -> Self {
        Self {
            info,
            bytes: Arc::new(bytes),
        }
    }

    pub fn index(&self) -> LogIndex {
        self.info.last_included_index
    }

    pub fn term(&self) -> Term {
        self.info.last_included_term
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The chunk starting at `offset`, or `None` past the end.
    pub fn chunk(&self, offset: u64, chunk_size: usize) -> Option<SnapshotChunk> {
        let start = usize::try_from(offset).ok()?;
        if start > self.bytes.len() || (start == self.bytes.len() && start != 0) {
            return None;
        }
        let end = (start + chunk_size.max(1)).min(self.bytes.len());
        Some(SnapshotChunk {
            offset,
            data: self.bytes[start..end].to_vec(),
            last_chunk: end == self.bytes.len(),
        })
    }
}

/// Persisting a freshly taken snapshot, handed to a background task so the
/// consensus loop never waits on the disk write.
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    pub index: LogIndex,
    pub term: Term,
    bytes: Arc<Vec<u8>>,
    path: Option<PathBuf>,
}

impl SnapshotJob {
    /// Blocking; run it on a blocking-capable thread.
    pub fn write(&self) -> Result<(), SnapshotError> {
        if let Some(path) = &self.path {
            write_bytes_atomic(path, &self.bytes)?;
        }
        Ok(())
    }
}

/// What happened to a received InstallSnapshot chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted { next_offset: u64 },
    /// Already buffered; acknowledged without re-appending.
    Duplicate { next_offset: u64 },
    /// Gap or unknown transfer; the sender must resume at `expected_offset`.
    Rejected { expected_offset: u64 },
    /// Final chunk received and the assembled image validated.
    Complete(Box<SnapshotImage>),
    /// Final chunk received but the image is unusable; restart from 0.
    Corrupt(String),
}

#[derive(Debug)]
struct ChunkBuffer {
    index: LogIndex,
    term: Term,
    data: Vec<u8>,
}

pub struct SnapshotManager {
    dir: Option<PathBuf>,
    current: Option<StoredSnapshot>,
    pending: Option<StoredSnapshot>,
    receiving: Option<ChunkBuffer>,
}

impl SnapshotManager {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            current: None,
            pending: None,
            receiving: None,
        }
    }

    fn path(&self) -> Option<PathBuf> {
        self.dir.as_deref().map(|d: &Path| d.join(SNAPSHOT_FILE))
    }

    /// Loads the persisted snapshot, if any, making it current.
    pub fn load(&mut self) -> Result<Option<SnapshotImage>, SnapshotError> {
        let Some(path) = self.path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let image = SnapshotImage::decode(&bytes)?;
        self.current = Some(StoredSnapshot::new(image.info.clone(), bytes));
        Ok(Some(image))
    }

    pub fn current(&self) -> Option<&StoredSnapshot> {
        self.current.as_ref()
    }

    pub fn last_included(&self) -> (LogIndex, Term) {
        self.current
            .as_ref()
            .map(|s| (s.index(), s.term()))
            .unwrap_or((0, 0))
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts a snapshot from an image captured by the caller.
    pub fn begin(&mut self, image: &SnapshotImage) -> Result<SnapshotJob, SnapshotError> {
        if self.pending.is_some() {
            return Err(SnapshotError::InProgress);
        }
        let stored = StoredSnapshot::new(image.info.clone(), image.encode());
        let job = SnapshotJob {
            index: stored.index(),
            term: stored.term(),
            bytes: stored.bytes.clone(),
            path: self.path(),
        };
        self.pending = Some(stored);
        Ok(job)
    }

    /// Promotes the pending snapshot once its background write succeeded.
    pub fn complete(&mut self, index: LogIndex) -> Result<SnapshotInfo, SnapshotError> {
        match self.pending.take() {
            Some(stored) if stored.index() == index => {
                let info = stored.info.clone();
                if stored.index() > self.last_included().0 {
                    self.current = Some(stored);
                }
                Ok(info)
            }
            other => {
                self.pending = other;
                Err(SnapshotError::NotFound)
            }
        }
    }

    pub fn abort(&mut self) {
        self.pending = None;
    }

    pub fn next_chunk(&self, offset: u64, chunk_size: usize) -> Option<SnapshotChunk> {
        self.current.as_ref()?.chunk(offset, chunk_size)
    }

    /// Buffers one chunk of an incoming snapshot.
    pub fn receive_chunk(
        &mut self,
        index: LogIndex,
        term: Term,
        chunk: SnapshotChunk,
    ) -> ChunkOutcome {
        if chunk.offset == 0 {
            self.receiving = Some(ChunkBuffer {
                index,
                term,
                data: Vec::new(),
            });
        }
        let Some(buffer) = self
            .receiving
            .as_mut()
            .filter(|b| b.index == index && b.term == term)
        else {
            return ChunkOutcome::Rejected { expected_offset: 0 };
        };

        let expected = buffer.data.len() as u64;
        if chunk.offset < expected {
            return ChunkOutcome::Duplicate {
                next_offset: expected,
            };
        }
        if chunk.offset > expected {
            return ChunkOutcome::Rejected {
                expected_offset: expected,
            };
        }
        buffer.data.extend_from_slice(&chunk.data);
        if !chunk.last_chunk {
            return ChunkOutcome::Accepted {
                next_offset: buffer.data.len() as u64,
            };
        }

        let Some(buffer) = self.receiving.take() else {
            return ChunkOutcome::Rejected { expected_offset: 0 };
        };
        match SnapshotImage::decode(&buffer.data) {
            Ok(image)
                if image.info.last_included_index == index
                    && image.info.last_included_term == term =>
            {
                ChunkOutcome::Complete(Box::new(image))
            }
            Ok(image) => ChunkOutcome::Corrupt(format!(
                "image describes {}/{}, transfer announced {index}/{term}",
                image.info.last_included_index, image.info.last_included_term
            )),
            Err(e) => ChunkOutcome::Corrupt(e.to_string()),
        }
    }

    /// Makes a received image current and persists it before returning.
    pub fn install(&mut self, image: &SnapshotImage) -> Result<(), SnapshotError> {
        let bytes = image.encode();
        if let Some(path) = self.path() {
            write_bytes_atomic(&path, &bytes)?;
        }
        self.current = Some(StoredSnapshot::new(image.info.clone(), bytes));
        self.receiving = None;
        Ok(())
    }
}
