//! File-backed log store.
//!
//! Layout inside the data directory:
//! - `raft.log`: one JSON-encoded entry per line, fsynced per append batch
//! - `log_meta.json`: compaction base (index and term)
//! - `state.json`: [`HardState`]
//!
//! Metadata files and log rewrites go through a `.tmp` file followed by a
//! rename, so a crash leaves either the old or the new version on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::raft::log::{EntryBuffer, LogError, LogResult, LogStore};
use crate::raft::state::{HardState, LogEntry, LogIndex, Term};

const LOG_FILE: &str = "raft.log";
const META_FILE: &str = "log_meta.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LogMeta {
    base_index: LogIndex,
    base_term: Term,
}

pub struct FileLog {
    dir: PathBuf,
    buffer: EntryBuffer,
    hard_state: HardState,
    writer: BufWriter<File>,
}

impl FileLog {
    /// Opens (or creates) the log in `dir`, loading every persisted entry.
    pub fn open(dir: impl AsRef<Path>) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta: LogMeta = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let hard_state: HardState = read_json(&dir.join(STATE_FILE))?.unwrap_or_default();

        let mut buffer = EntryBuffer::with_base(meta.base_index, meta.base_term);
        let log_path = dir.join(LOG_FILE);
        let torn = log_path.exists() && load_entries(&log_path, &mut buffer)?;

        let writer = open_append(&log_path)?;
        tracing::debug!(
            dir = %dir.display(),
            first_index = buffer.first_index(),
            last_index = buffer.last_index(),
            term = hard_state.term,
            "Opened log"
        );

        let mut log = Self {
            dir,
            buffer,
            hard_state,
            writer,
        };
        if torn {
            log.rewrite()?;
        }
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrites the log file from the in-memory buffer.
    fn rewrite(&mut self) -> LogResult<()> {
        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            for entry in self.buffer.iter() {
                write_line(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.writer = open_append(&path)?;
        Ok(())
    }

    fn save_meta(&self) -> LogResult<()> {
        let (base_index, base_term) = self.buffer.base();
        write_json_atomic(
            &self.dir.join(META_FILE),
            &LogMeta {
                base_index,
                base_term,
            },
        )
    }
}

impl LogStore for FileLog {
    fn append(&mut self, entries: &[LogEntry]) -> LogResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.buffer.check_append(entries)?;
        for entry in entries {
            write_line(&mut self.writer, entry)?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.buffer.append(entries)
    }

    fn truncate_from(&mut self, index: LogIndex) -> LogResult<()> {
        self.buffer.check_truncate(index)?;
        if index > self.buffer.last_index() {
            return Ok(());
        }
        self.buffer.truncate_from(index)?;
        self.rewrite()
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
        if index <= self.buffer.base().0 {
            return Ok(());
        }
        self.buffer.compact_up_to(index, term)?;
        // Meta first: entries at or below the base are skipped on load.
        self.save_meta()?;
        self.rewrite()
    }

    fn reset(&mut self, index: LogIndex, term: Term) -> LogResult<()> {
        self.buffer.reset(index, term);
        self.save_meta()?;
        self.rewrite()
    }

    fn save_hard_state(&mut self, state: &HardState) -> LogResult<()> {
        if *state == self.hard_state {
            return Ok(());
        }
        write_json_atomic(&self.dir.join(STATE_FILE), state)?;
        self.hard_state = state.clone();
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }
}

/// Returns true if a torn final line was dropped.
fn load_entries(path: &Path, buffer: &mut EntryBuffer) -> LogResult<bool> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            // A torn final line is what an interrupted append leaves behind
            Err(e) if lines.peek().is_none() => {
                tracing::warn!(error = %e, "Ignoring torn entry at end of log");
                return Ok(true);
            }
            Err(e) => return Err(LogError::Corrupt(e.to_string())),
        };
        if entry.index <= buffer.base().0 {
            continue;
        }
        buffer
            .append(std::slice::from_ref(&entry))
            .map_err(|_| LogError::Corrupt(format!("unexpected entry index {}", entry.index)))?;
    }
    Ok(false)
}

fn write_line(writer: &mut BufWriter<File>, entry: &LogEntry) -> LogResult<()> {
    serde_json::to_writer(&mut *writer, entry).map_err(|e| LogError::Io(e.to_string()))?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn open_append(path: &Path) -> LogResult<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> LogResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .map(Some)
        .map_err(|e| LogError::Corrupt(format!("{}: {e}", path.display())))
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> LogResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| LogError::Io(e.to_string()))?;
    write_bytes_atomic(path, &bytes)?;
    Ok(())
}

/// Writes `bytes` to `path` via a synced temporary file and a rename.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
