//! Raft log storage.
//!
//! [`LogStore`] is the seam between the consensus core and durable storage.
//! [`MemoryLog`] keeps everything in memory; [`crate::raft::storage::FileLog`]
//! layers file persistence on top of the same in-memory index.

use std::collections::VecDeque;

use thiserror::Error;

use crate::raft::state::{HardState, LogEntry, LogIndex, Term};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The underlying storage failed. Fatal for the group.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("index {0} is out of range")]
    IndexOutOfRange(LogIndex),

    /// Persisted data could not be decoded.
    #[error("corrupt log: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Ordered, index-addressable sequence of log entries with a compacted prefix.
///
/// Indices are contiguous: the first retained entry is `first_index()` and
/// everything at or below `first_index() - 1` lives only in a snapshot.
pub trait LogStore: Send {
    /// Appends entries whose indices continue the log exactly.
    fn append(&mut self, entries: &[LogEntry]) -> LogResult<()>;

    /// Removes `index` and everything after it. Never touches the compacted prefix.
    fn truncate_from(&mut self, index: LogIndex) -> LogResult<()>;

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry>;

    /// Up to `max` entries starting at `start`.
    fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry>;

    fn first_index(&self) -> LogIndex;

    fn last_index(&self) -> LogIndex;

    fn last_term(&self) -> Term;

    /// Term at `index`; also answers for the compaction base.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Drops every entry up to and including `index`, remembering `term` as
    /// the term of the new base.
    fn compact_up_to(&mut self, index: LogIndex, term: Term) -> LogResult<()>;

    /// Discards the whole log and restarts it after a snapshot at `index`.
    fn reset(&mut self, index: LogIndex, term: Term) -> LogResult<()>;

    fn save_hard_state(&mut self, state: &HardState) -> LogResult<()>;

    fn hard_state(&self) -> HardState;
}

/// In-memory entry index shared by both log store implementations.
#[derive(Debug, Default, Clone)]
pub struct EntryBuffer {
    entries: VecDeque<LogEntry>,
    /// Index of the last compacted entry (0 if nothing was compacted).
    base_index: LogIndex,
    base_term: Term,
}

impl EntryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base_index: LogIndex, base_term: Term) -> Self {
        Self {
            entries: VecDeque::new(),
            base_index,
            base_term,
        }
    }

    pub fn base(&self) -> (LogIndex, Term) {
        (self.base_index, self.base_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn first_index(&self) -> LogIndex {
        self.base_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.base_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    pub fn check_append(&self, entries: &[LogEntry]) -> LogResult<()> {
        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(LogError::IndexOutOfRange(entry.index));
            }
            expected += 1;
        }
        Ok(())
    }

    pub fn append(&mut self, entries: &[LogEntry]) -> LogResult<()> {
        self.check_append(entries)?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    pub fn check_truncate(&self, index: LogIndex) -> LogResult<()> {
        if index <= self.base_index || index > self.last_index() + 1 {
            return Err(LogError::IndexOutOfRange(index));
        }
        Ok(())
    }

    pub fn truncate_from(&mut self, index: LogIndex) -> LogResult<()> {
        self.check_truncate(index)?;
        self.entries.truncate((index - self.first_index()) as usize);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.base_index {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    pub fn slice_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.first_index());
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((start - self.first_index()) as usize)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn compact_up_to(&mut self, index: LogIndex, term: Term) -> LogResult<()> {
        if index <= self.base_index {
            return Ok(());
        }
        if index > self.last_index() {
            return Err(LogError::IndexOutOfRange(index));
        }
        let drop_count = (index - self.base_index) as usize;
        self.entries.drain(..drop_count);
        self.base_index = index;
        self.base_term = term;
        Ok(())
    }

    pub fn reset(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.base_index = index;
        self.base_term = term;
    }
}

/// Volatile log store; loses everything on restart.
#[derive(Debug, Default)]
pub struct MemoryLog {
    buffer: EntryBuffer,
    hard_state: HardState,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entries: &[LogEntry]) -> LogResult<()> {
        self.buffer.append(entries)
    }

    fn truncate_from(&mut self, index: LogIndex) -> LogResult<()> {
        self.buffer.truncate_from(index)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.buffer.get(index)
    }

    fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        self.buffer.slice_from(start, max)
    }

    fn first_index(&self) -> LogIndex {
        self.buffer.first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.buffer.last_index()
    }

    fn last_term(&self) -> Term {
        self.buffer.last_term()
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.buffer.term_at(index)
    }

    fn compact_up_to(&mut self, index: LogIndex, term: Term) -> LogResult<()> {
        self.buffer.compact_up_to(index, term)
    }

    fn reset(&mut self, index: LogIndex, term: Term) -> LogResult<()> {
        self.buffer.reset(index, term);
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> LogResult<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }
}
