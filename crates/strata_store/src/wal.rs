//! Crash-safe write-ahead log for the storage engine.
//!
//! Frame format on disk, big-endian: `[crc32:4][len:4][payload]` where the
//! checksum covers the payload bytes only. The payload encodes one mutation:
//! `[kind:1][seq:8][klen:4][key][vlen:4][value]`. Replay stops silently at
//! the first frame whose checksum, length, or tail does not check out — the
//! log is considered truncated there and the valid prefix wins.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

/// Frames larger than this mark a torn or corrupt tail.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Kind tag of one logged mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordKind {
    Put = 0x01,
    Delete = 0x02,
}

impl WalRecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Put),
            0x02 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One logged mutation, sequence-stamped by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub sequence: u64,
}

impl WalRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>, sequence: u64) -> Self {
        Self {
            kind: WalRecordKind::Put,
            key,
            value,
            sequence,
        }
    }

    pub fn delete(key: Vec<u8>, sequence: u64) -> Self {
        Self {
            kind: WalRecordKind::Delete,
            key,
            value: Vec::new(),
            sequence,
        }
    }
}

struct WriterInner {
    file: Option<File>,
    bytes_written: u64,
}

/// Appender over one log file. A mutex keeps frame boundaries intact under
/// concurrent producers.
pub struct WalWriter {
    path: PathBuf,
    inner: Mutex<WriterInner>,
}

impl WalWriter {
    /// Open the log for appending, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open wal {}", path.display()))?;
        Ok(Self {
            path,
            inner: Mutex::new(WriterInner {
                file: Some(file),
                bytes_written: 0,
            }),
        })
    }

    /// Persist one frame (write + flush). Returns the bytes appended.
    pub fn append(&self, record: &WalRecord) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file.as_mut().context("wal already closed")?;
        let written = write_frame(file, record)?;
        file.flush().context("flush wal")?;
        inner.bytes_written += written;
        Ok(written)
    }

    /// Append every record in order, then flush once.
    pub fn append_batch(&self, records: &[WalRecord]) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file.as_mut().context("wal already closed")?;
        let mut written = 0;
        for record in records {
            written += write_frame(file, record)?;
        }
        file.flush().context("flush wal")?;
        inner.bytes_written += written;
        Ok(written)
    }

    pub fn sync(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file.as_mut().context("wal already closed")?;
        file.sync_data().context("sync wal")
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().unwrap().bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and release the file handle. Further appends fail.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut file) = inner.file.take() {
            file.flush().context("flush wal on close")?;
        }
        Ok(())
    }
}

fn write_frame(file: &mut File, record: &WalRecord) -> anyhow::Result<u64> {
    let payload = encode_record(record);
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    file.write_all(&checksum.to_be_bytes()).context("write wal checksum")?;
    file.write_all(&(payload.len() as u32).to_be_bytes())
        .context("write wal length")?;
    file.write_all(&payload).context("write wal payload")?;
    Ok(8 + payload.len() as u64)
}

fn encode_record(record: &WalRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 4 + record.key.len() + 4 + record.value.len());
    out.push(record.kind as u8);
    out.extend_from_slice(&record.sequence.to_be_bytes());
    out.extend_from_slice(&(record.key.len() as u32).to_be_bytes());
    out.extend_from_slice(&record.key);
    out.extend_from_slice(&(record.value.len() as u32).to_be_bytes());
    out.extend_from_slice(&record.value);
    out
}

fn decode_record(payload: &[u8]) -> Option<WalRecord> {
    let mut offset = 0usize;
    let kind = WalRecordKind::from_u8(*payload.first()?)?;
    offset += 1;
    let sequence = u64::from_be_bytes(payload.get(offset..offset + 8)?.try_into().ok()?);
    offset += 8;
    let klen = u32::from_be_bytes(payload.get(offset..offset + 4)?.try_into().ok()?) as usize;
    offset += 4;
    let key = payload.get(offset..offset + klen)?.to_vec();
    offset += klen;
    let vlen = u32::from_be_bytes(payload.get(offset..offset + 4)?.try_into().ok()?) as usize;
    offset += 4;
    let value = payload.get(offset..offset + vlen)?.to_vec();
    Some(WalRecord {
        kind,
        key,
        value,
        sequence,
    })
}

/// Replay every valid frame from the start of `path`, invoking `cb` per
/// record. A missing file replays zero records. Returns the replayed count.
pub fn replay(path: impl AsRef<Path>, mut cb: impl FnMut(WalRecord)) -> anyhow::Result<usize> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).context("open wal for replay"),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut count = 0usize;
    loop {
        let mut header = [0u8; 8];
        match read_exact_or_eof(&mut reader, &mut header) {
            Ok(true) => {}
            // Clean end or torn header: the log ends here.
            Ok(false) | Err(_) => break,
        }
        let stored_crc = u32::from_be_bytes(header[..4].try_into().unwrap());
        let len = u32::from_be_bytes(header[4..].try_into().unwrap()) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            break;
        }
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            break;
        }
        let Some(record) = decode_record(&payload) else {
            break;
        };
        cb(record);
        count += 1;
    }
    Ok(count)
}

/// Ok(false) on clean EOF before the first byte, Err on a torn read.
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
