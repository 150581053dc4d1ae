//! Durable Raft log and persistent term/vote state.
//!
//! Layout under the log directory:
//! - `raft_log.dat` — framed entries `[term:8][index:8][kind:1][cmd_len:4][cmd]`,
//!   big-endian, appended in index order.
//! - `raft_state.dat` — `[current_term:8][voted_for:4 signed]`, rewritten whole.
//!
//! Loading stops at the first truncated or implausible frame and keeps the
//! valid prefix. The in-memory window is the compacting variant: entries below
//! `first_index` have been dropped, and any lookup below it is a programming
//! error rather than a silent miss.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

use super::types::{EntryKind, LogEntry, PersistentState};

const LOG_FILE: &str = "raft_log.dat";
const STATE_FILE: &str = "raft_state.dat";

/// Upper bound on a single command payload; anything larger marks a torn tail.
const MAX_COMMAND_LEN: usize = 64 * 1024 * 1024;

struct LogInner {
    entries: VecDeque<LogEntry>,
    first_index: u64,
    state: PersistentState,
    file: File,
}

/// Append-only entry log with synchronous persistence.
pub struct RaftLog {
    dir: PathBuf,
    inner: Mutex<LogInner>,
}

impl RaftLog {
    /// Open (or create) the log directory and load any persisted entries and
    /// state. A corrupt tail is discarded with a warning.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create raft log dir")?;

        let state = load_state(&dir.join(STATE_FILE));
        let entries = load_entries(&dir.join(LOG_FILE));
        let first_index = entries.front().map(|e| e.index).unwrap_or(1);
        let file = open_for_append(&dir.join(LOG_FILE))?;

        Ok(Self {
            dir,
            inner: Mutex::new(LogInner {
                entries,
                first_index,
                state,
                file,
            }),
        })
    }

    /// Append one entry; `entry.index` must directly follow the current tail.
    pub fn append(&self, entry: LogEntry) -> anyhow::Result<()> {
        self.append_batch(std::slice::from_ref(&entry))
    }

    /// Append a run of contiguous entries with a single flush at the end.
    pub fn append_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            let expected = inner.first_index + inner.entries.len() as u64;
            anyhow::ensure!(
                entry.index == expected,
                "non-contiguous raft append: index {} expected {}",
                entry.index,
                expected
            );
            let frame = encode_entry(entry);
            inner.file.write_all(&frame).context("append raft entry")?;
            inner.entries.push_back(entry.clone());
        }
        inner.file.flush().context("flush raft log")?;
        Ok(())
    }

    /// Drop every entry at `from_index` and above, on disk and in memory.
    /// Used only on the AppendEntries conflict path.
    pub fn truncate_from(&self, from_index: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if from_index < inner.first_index {
            debug_assert!(false, "truncate below first_index {}", inner.first_index);
            anyhow::bail!("truncate index {from_index} precedes compacted prefix");
        }
        let keep = (from_index - inner.first_index) as usize;
        if keep >= inner.entries.len() {
            return Ok(());
        }
        inner.entries.truncate(keep);
        self.rewrite(&mut inner)
    }

    /// Physically drop entries below `keep_from`. Callers must never compact
    /// past any follower's match index (no snapshot transfer exists).
    pub fn compact_to(&self, keep_from: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if keep_from <= inner.first_index {
            return Ok(());
        }
        let last = inner.first_index + inner.entries.len() as u64;
        anyhow::ensure!(keep_from <= last, "compact past the log tail");
        let drop = (keep_from - inner.first_index) as usize;
        inner.entries.drain(..drop);
        inner.first_index = keep_from;
        self.rewrite(&mut inner)
    }

    /// Entry at an absolute index, if still held. An index below the compacted
    /// prefix is a programming error.
    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        let inner = self.inner.lock().unwrap();
        if index == 0 {
            return None;
        }
        if index < inner.first_index {
            debug_assert!(false, "entry lookup below first_index {}", inner.first_index);
            return None;
        }
        let offset = (index - inner.first_index) as usize;
        inner.entries.get(offset).cloned()
    }

    /// Term stored at `index`, or 0 when the slot is absent.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Entries in the inclusive range `[from, to]`, clamped to what is held.
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for index in from..=to {
            if index < inner.first_index {
                debug_assert!(false, "slice below first_index {}", inner.first_index);
                continue;
            }
            let offset = (index - inner.first_index) as usize;
            match inner.entries.get(offset) {
                Some(e) => out.push(e.clone()),
                None => break,
            }
        }
        out
    }

    pub fn first_index(&self) -> u64 {
        self.inner.lock().unwrap().first_index
    }

    pub fn last_index(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            inner.first_index - 1
        } else {
            inner.first_index + inner.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.entries.back().map(|e| e.term).unwrap_or(0)
    }

    pub fn state(&self) -> PersistentState {
        self.inner.lock().unwrap().state
    }

    /// Persist a new (term, vote) pair before it is announced anywhere.
    pub fn set_state(&self, state: PersistentState) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = self.dir.join(STATE_FILE);
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&state.current_term.to_be_bytes());
        buf[8..].copy_from_slice(&state.voted_for.to_be_bytes());
        let mut file = File::create(&path).context("create raft state file")?;
        file.write_all(&buf).context("write raft state")?;
        file.flush().context("flush raft state")?;
        inner.state = state;
        Ok(())
    }

    /// Rewrite the on-disk log to match the in-memory window exactly.
    fn rewrite(&self, inner: &mut LogInner) -> anyhow::Result<()> {
        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut out = File::create(&tmp).context("create raft log rewrite")?;
            for entry in &inner.entries {
                out.write_all(&encode_entry(entry))
                    .context("rewrite raft entry")?;
            }
            out.flush().context("flush raft log rewrite")?;
            out.sync_all().context("sync raft log rewrite")?;
        }
        fs::rename(&tmp, &path).context("swap raft log")?;
        inner.file = open_for_append(&path)?;
        Ok(())
    }
}

fn open_for_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open raft log {}", path.display()))
}

fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 1 + 4 + entry.command.len());
    out.extend_from_slice(&entry.term.to_be_bytes());
    out.extend_from_slice(&entry.index.to_be_bytes());
    out.push(entry.kind as u8);
    out.extend_from_slice(&(entry.command.len() as u32).to_be_bytes());
    out.extend_from_slice(&entry.command);
    out
}

fn load_state(path: &Path) -> PersistentState {
    let Ok(mut file) = File::open(path) else {
        return PersistentState::default();
    };
    let mut buf = [0u8; 12];
    match file.read_exact(&mut buf) {
        Ok(()) => PersistentState {
            current_term: u64::from_be_bytes(buf[..8].try_into().unwrap()),
            voted_for: i32::from_be_bytes(buf[8..].try_into().unwrap()),
        },
        Err(_) => {
            tracing::warn!(path = %path.display(), "short raft state file, starting fresh");
            PersistentState::default()
        }
    }
}

/// Read the valid frame prefix; stop silently at the first torn frame.
fn load_entries(path: &Path) -> VecDeque<LogEntry> {
    let Ok(file) = File::open(path) else {
        return VecDeque::new();
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries = VecDeque::new();
    loop {
        let mut header = [0u8; 21];
        match read_exact_or_eof(&mut reader, &mut header) {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => break,
        }
        let term = u64::from_be_bytes(header[..8].try_into().unwrap());
        let index = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let Some(kind) = EntryKind::from_u8(header[16]) else {
            tracing::warn!(path = %path.display(), index, "bad raft entry kind, truncating");
            break;
        };
        let cmd_len = u32::from_be_bytes(header[17..21].try_into().unwrap()) as usize;
        if cmd_len > MAX_COMMAND_LEN {
            tracing::warn!(path = %path.display(), index, cmd_len, "implausible raft frame, truncating");
            break;
        }
        let mut command = vec![0u8; cmd_len];
        if reader.read_exact(&mut command).is_err() {
            tracing::warn!(path = %path.display(), index, "torn raft frame tail, truncating");
            break;
        }
        entries.push_back(LogEntry {
            term,
            index,
            kind,
            command,
        });
    }
    entries
}

/// Returns Ok(false) on clean EOF before the first byte, Err on a torn read.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64, cmd: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            kind: EntryKind::Normal,
            command: cmd.to_vec(),
        }
    }

    #[test]
    fn append_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RaftLog::open(dir.path()).unwrap();
            log.append(entry(1, 1, b"a")).unwrap();
            log.append(entry(1, 2, b"b")).unwrap();
            log.append(entry(2, 3, b"c")).unwrap();
            log.set_state(PersistentState {
                current_term: 2,
                voted_for: 3,
            })
            .unwrap();
        }

        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(2).unwrap().command, b"b");
        assert_eq!(log.term_at(3), 2);
        let state = log.state();
        assert_eq!(state.current_term, 2);
        assert_eq!(state.voted_for, 3);
    }

    #[test]
    fn rejects_non_contiguous_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = RaftLog::open(dir.path()).unwrap();
        log.append(entry(1, 1, b"a")).unwrap();
        assert!(log.append(entry(1, 3, b"gap")).is_err());
    }

    #[test]
    fn truncate_removes_suffix_durably() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RaftLog::open(dir.path()).unwrap();
            for i in 1..=5 {
                log.append(entry(1, i, b"x")).unwrap();
            }
            log.truncate_from(3).unwrap();
            assert_eq!(log.last_index(), 2);
            log.append(entry(2, 3, b"y")).unwrap();
        }
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.term_at(2), 1);
    }

    #[test]
    fn torn_tail_keeps_valid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RaftLog::open(dir.path()).unwrap();
            log.append(entry(1, 1, b"keep")).unwrap();
            log.append(entry(1, 2, b"keep too")).unwrap();
        }
        // Chop the file mid-frame.
        let path = dir.path().join(LOG_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.entry(1).unwrap().command, b"keep");
    }

    #[test]
    fn compact_drops_prefix_and_guards_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let log = RaftLog::open(dir.path()).unwrap();
        for i in 1..=6 {
            log.append(entry(1, i, b"x")).unwrap();
        }
        log.compact_to(4).unwrap();
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 6);
        assert!(log.entry(5).is_some());
        assert_eq!(log.slice(4, 6).len(), 3);
    }

    #[test]
    fn missing_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = RaftLog::open(dir.path().join("fresh")).unwrap();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.state(), PersistentState::default());
    }
}
