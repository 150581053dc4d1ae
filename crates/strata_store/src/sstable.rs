//! Immutable sorted on-disk runs.
//!
//! File layout, big-endian:
//!
//! ```text
//! [DataBlock 0]..[DataBlock N] [MetaBlock = bloom] [IndexBlock] [Footer]
//! DataBlock entry : [klen:4][user_key || seq:8 || kind:1][vlen:4][value]
//! IndexBlock entry: [klen:4][largest user_key][offset:8][size:8]
//! Footer (48 B)   : [meta handle:16][index handle:16][entry_count:8][magic:8]
//! ```
//!
//! Keys are added in ascending internal-key order, so within one user key the
//! highest sequence appears first. The meta block carries a bloom filter over
//! user keys; a rejected probe never touches a data block.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

use crate::memtable::{InternalKey, ValueKind};

const TABLE_MAGIC: u64 = 0x7374_7261_7461_3031; // "strata01"
const FOOTER_LEN: u64 = 48;

/// Outcome of a single-table point lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableLookup {
    /// The bloom filter rejected the key; no data block was read.
    Filtered,
    Missing,
    Found(Vec<u8>),
    Deleted,
}

// ── Bloom filter ──

/// Bit-array bloom filter over user keys, sized for ~1% false positives.
/// Zero false negatives by construction.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u32;
        let num_hashes = ((-fp_rate.ln()) / ln2).round().max(1.0) as u32;
        Self {
            bits: vec![0u8; ((num_bits as usize) + 7) / 8],
            num_bits,
            num_hashes,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = bloom_hashes(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = bloom_hashes(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_be_bytes());
        out.extend_from_slice(&self.num_hashes.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(data.len() >= 8, "bloom block too short");
        let num_bits = u32::from_be_bytes(data[..4].try_into().unwrap());
        let num_hashes = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let byte_len = ((num_bits as usize) + 7) / 8;
        anyhow::ensure!(num_hashes >= 1, "bloom with zero hashes");
        anyhow::ensure!(data.len() >= 8 + byte_len, "bloom bits truncated");
        Ok(Self {
            bits: data[8..8 + byte_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

/// Two FNV-1a streams with distinct bases drive double hashing.
fn bloom_hashes(key: &[u8]) -> (u64, u64) {
    let h1 = fnv1a64(0xcbf2_9ce4_8422_2325, key);
    let h2 = fnv1a64(0x8422_2325_cbf2_9ce4, key) | 1;
    (h1, h2)
}

fn fnv1a64(basis: u64, bytes: &[u8]) -> u64 {
    let mut hash = basis;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ── Block handle / footer ──

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
    }

    fn decode(data: &[u8]) -> Self {
        Self {
            offset: u64::from_be_bytes(data[..8].try_into().unwrap()),
            size: u64::from_be_bytes(data[8..16].try_into().unwrap()),
        }
    }
}

fn encode_internal_key(key: &InternalKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.user_key.len() + 9);
    out.extend_from_slice(&key.user_key);
    out.extend_from_slice(&key.sequence.to_be_bytes());
    out.push(key.kind as u8);
    out
}

fn decode_internal_key(data: &[u8]) -> anyhow::Result<InternalKey> {
    anyhow::ensure!(data.len() >= 9, "internal key too short");
    let split = data.len() - 9;
    let user_key = data[..split].to_vec();
    let sequence = u64::from_be_bytes(data[split..split + 8].try_into().unwrap());
    let kind = ValueKind::from_u8(data[split + 8]).context("bad value kind in table entry")?;
    Ok(InternalKey::new(user_key, sequence, kind))
}

// ── Writer ──

/// Result of a finished table build.
#[derive(Clone, Debug)]
pub struct TableBuild {
    pub file_size: u64,
    pub entry_count: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

/// Streams sorted entries into a table file. `add` must be called in
/// ascending internal-key order.
pub struct TableBuilder {
    file: BufWriter<File>,
    block_size: usize,
    bloom: BloomFilter,
    entry_count: u64,
    offset: u64,
    current_block: Vec<u8>,
    block_last_user_key: Vec<u8>,
    index: Vec<(Vec<u8>, BlockHandle)>,
    smallest: Option<Vec<u8>>,
    largest: Vec<u8>,
}

impl TableBuilder {
    pub fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        expected_keys: usize,
    ) -> anyhow::Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("create sstable {}", path.as_ref().display()))?;
        Ok(Self {
            file: BufWriter::new(file),
            block_size,
            bloom: BloomFilter::new(expected_keys, 0.01),
            entry_count: 0,
            offset: 0,
            current_block: Vec::new(),
            block_last_user_key: Vec::new(),
            index: Vec::new(),
            smallest: None,
            largest: Vec::new(),
        })
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> anyhow::Result<()> {
        if self.current_block.len() >= self.block_size {
            self.flush_data_block()?;
        }

        self.bloom.add(&key.user_key);
        let encoded = encode_internal_key(key);
        self.current_block
            .extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        self.current_block.extend_from_slice(&encoded);
        self.current_block
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.current_block.extend_from_slice(value);

        if self.smallest.is_none() {
            self.smallest = Some(key.user_key.clone());
        }
        self.block_last_user_key = key.user_key.clone();
        self.largest = key.user_key.clone();
        self.entry_count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<TableBuild> {
        anyhow::ensure!(self.entry_count > 0, "refusing to write an empty table");
        if !self.current_block.is_empty() {
            self.flush_data_block()?;
        }

        let bloom_data = self.bloom.serialize();
        let meta_handle = BlockHandle {
            offset: self.offset,
            size: bloom_data.len() as u64,
        };
        self.file.write_all(&bloom_data).context("write meta block")?;
        self.offset += bloom_data.len() as u64;

        let mut index_data = Vec::new();
        for (largest_key, handle) in &self.index {
            index_data.extend_from_slice(&(largest_key.len() as u32).to_be_bytes());
            index_data.extend_from_slice(largest_key);
            handle.encode_into(&mut index_data);
        }
        let index_handle = BlockHandle {
            offset: self.offset,
            size: index_data.len() as u64,
        };
        self.file.write_all(&index_data).context("write index block")?;
        self.offset += index_data.len() as u64;

        let mut footer = Vec::with_capacity(FOOTER_LEN as usize);
        meta_handle.encode_into(&mut footer);
        index_handle.encode_into(&mut footer);
        footer.extend_from_slice(&self.entry_count.to_be_bytes());
        footer.extend_from_slice(&TABLE_MAGIC.to_be_bytes());
        self.file.write_all(&footer).context("write footer")?;
        self.offset += FOOTER_LEN;

        self.file.flush().context("flush sstable")?;
        self.file.get_ref().sync_all().context("sync sstable")?;

        Ok(TableBuild {
            file_size: self.offset,
            entry_count: self.entry_count,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.largest,
        })
    }

    fn flush_data_block(&mut self) -> anyhow::Result<()> {
        let handle = BlockHandle {
            offset: self.offset,
            size: self.current_block.len() as u64,
        };
        self.file
            .write_all(&self.current_block)
            .context("write data block")?;
        self.offset += self.current_block.len() as u64;
        self.index
            .push((std::mem::take(&mut self.block_last_user_key), handle));
        self.current_block.clear();
        Ok(())
    }
}

// ── Reader ──

/// Open table: footer-validated, bloom and index resident, data blocks read
/// on demand.
pub struct TableReader {
    path: PathBuf,
    file: Mutex<File>,
    bloom: BloomFilter,
    index: Vec<(Vec<u8>, BlockHandle)>,
    entry_count: u64,
    file_size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

impl TableReader {
    /// Open and validate a table. Any structural problem (short file, bad
    /// magic, truncated blocks) is an error; callers skip such files.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).with_context(|| format!("open sstable {}", path.display()))?;
        let file_size = file.metadata().context("stat sstable")?.len();
        anyhow::ensure!(file_size >= FOOTER_LEN, "sstable shorter than footer");

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
            .context("seek footer")?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer).context("read footer")?;
        let magic = u64::from_be_bytes(footer[40..48].try_into().unwrap());
        anyhow::ensure!(magic == TABLE_MAGIC, "bad sstable magic {magic:#x}");

        let meta_handle = BlockHandle::decode(&footer[..16]);
        let index_handle = BlockHandle::decode(&footer[16..32]);
        let entry_count = u64::from_be_bytes(footer[32..40].try_into().unwrap());
        anyhow::ensure!(
            meta_handle.offset + meta_handle.size <= file_size
                && index_handle.offset + index_handle.size <= file_size,
            "sstable handles out of bounds"
        );

        let bloom_data = read_at(&mut file, meta_handle)?;
        let bloom = BloomFilter::deserialize(&bloom_data)?;
        let index_data = read_at(&mut file, index_handle)?;
        let index = parse_index(&index_data, file_size)?;
        anyhow::ensure!(!index.is_empty(), "sstable with empty index");

        // Smallest user key comes from the first entry of the first block.
        let first_block = read_at(&mut file, index[0].1)?;
        let smallest = first_entry_user_key(&first_block)?;
        let largest = index.last().unwrap().0.clone();

        Ok(Self {
            path,
            file: Mutex::new(file),
            bloom,
            index,
            entry_count,
            file_size,
            smallest,
            largest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn smallest(&self) -> &[u8] {
        &self.smallest
    }

    pub fn largest(&self) -> &[u8] {
        &self.largest
    }

    /// Point lookup. Returns `Filtered` without any data-block read when the
    /// bloom filter rejects the key.
    pub fn get(&self, user_key: &[u8]) -> anyhow::Result<TableLookup> {
        if !self.bloom.may_contain(user_key) {
            return Ok(TableLookup::Filtered);
        }

        // First block whose largest key is >= the probe key.
        let idx = self
            .index
            .partition_point(|(largest, _)| largest.as_slice() < user_key);
        if idx == self.index.len() {
            return Ok(TableLookup::Missing);
        }

        let block = {
            let mut file = self.file.lock().unwrap();
            read_at(&mut file, self.index[idx].1)?
        };

        // Entries are in internal-key order: the first match carries the
        // highest sequence for the key.
        let mut offset = 0usize;
        while offset < block.len() {
            let (key, value, next) = decode_entry(&block, offset)?;
            match key.user_key.as_slice().cmp(user_key) {
                std::cmp::Ordering::Less => offset = next,
                std::cmp::Ordering::Equal => {
                    return Ok(match key.kind {
                        ValueKind::Value => TableLookup::Found(value),
                        ValueKind::Deletion => TableLookup::Deleted,
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(TableLookup::Missing)
    }

    /// Visit every entry in internal-key order (compaction input).
    pub fn for_each_entry(
        &self,
        mut cb: impl FnMut(InternalKey, Vec<u8>),
    ) -> anyhow::Result<()> {
        for (_, handle) in &self.index {
            let block = {
                let mut file = self.file.lock().unwrap();
                read_at(&mut file, *handle)?
            };
            let mut offset = 0usize;
            while offset < block.len() {
                let (key, value, next) = decode_entry(&block, offset)?;
                cb(key, value);
                offset = next;
            }
        }
        Ok(())
    }
}

fn read_at(file: &mut File, handle: BlockHandle) -> anyhow::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(handle.offset)).context("seek block")?;
    let mut buf = vec![0u8; handle.size as usize];
    file.read_exact(&mut buf).context("read block")?;
    Ok(buf)
}

fn parse_index(data: &[u8], file_size: u64) -> anyhow::Result<Vec<(Vec<u8>, BlockHandle)>> {
    let mut index = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        anyhow::ensure!(offset + 4 <= data.len(), "index entry header truncated");
        let klen = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        anyhow::ensure!(offset + klen + 16 <= data.len(), "index entry truncated");
        let key = data[offset..offset + klen].to_vec();
        offset += klen;
        let handle = BlockHandle::decode(&data[offset..offset + 16]);
        offset += 16;
        anyhow::ensure!(
            handle.offset + handle.size <= file_size,
            "index handle out of bounds"
        );
        index.push((key, handle));
    }
    Ok(index)
}

fn decode_entry(block: &[u8], offset: usize) -> anyhow::Result<(InternalKey, Vec<u8>, usize)> {
    anyhow::ensure!(offset + 4 <= block.len(), "entry key header truncated");
    let klen = u32::from_be_bytes(block[offset..offset + 4].try_into().unwrap()) as usize;
    let mut pos = offset + 4;
    anyhow::ensure!(pos + klen <= block.len(), "entry key truncated");
    let key = decode_internal_key(&block[pos..pos + klen])?;
    pos += klen;
    anyhow::ensure!(pos + 4 <= block.len(), "entry value header truncated");
    let vlen = u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    anyhow::ensure!(pos + vlen <= block.len(), "entry value truncated");
    let value = block[pos..pos + vlen].to_vec();
    Ok((key, value, pos + vlen))
}

fn first_entry_user_key(block: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (key, _, _) = decode_entry(block, 0)?;
    Ok(key.user_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_table(
        dir: &Path,
        name: &str,
        block_size: usize,
        entries: &[(&[u8], u64, ValueKind, &[u8])],
    ) -> PathBuf {
        let path = dir.join(name);
        let mut builder = TableBuilder::create(&path, block_size, entries.len()).unwrap();
        for (user_key, seq, kind, value) in entries {
            builder
                .add(&InternalKey::new(user_key.to_vec(), *seq, *kind), value)
                .unwrap();
        }
        builder.finish().unwrap();
        path
    }

    #[test]
    fn round_trip_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = Vec::new();
        let values: Vec<(Vec<u8>, Vec<u8>)> = (0..200)
            .map(|i| {
                (
                    format!("key{i:05}").into_bytes(),
                    format!("value-{i}").into_bytes(),
                )
            })
            .collect();
        for (i, (key, value)) in values.iter().enumerate() {
            entries.push((key.as_slice(), i as u64, ValueKind::Value, value.as_slice()));
        }
        // Tiny blocks force many data blocks and index entries.
        let path = build_table(dir.path(), "t.sst", 64, &entries);

        let reader = TableReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 200);
        assert_eq!(reader.smallest(), b"key00000");
        assert_eq!(reader.largest(), b"key00199");
        for (key, value) in &values {
            assert_eq!(
                reader.get(key).unwrap(),
                TableLookup::Found(value.clone()),
                "key {}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn highest_sequence_wins_within_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_table(
            dir.path(),
            "t.sst",
            4096,
            &[
                (b"a", 9, ValueKind::Value, b"new"),
                (b"a", 3, ValueKind::Value, b"old"),
                (b"b", 7, ValueKind::Deletion, b""),
                (b"b", 2, ValueKind::Value, b"shadowed"),
            ],
        );
        let reader = TableReader::open(&path).unwrap();
        assert_eq!(reader.get(b"a").unwrap(), TableLookup::Found(b"new".to_vec()));
        assert_eq!(reader.get(b"b").unwrap(), TableLookup::Deleted);
    }

    #[test]
    fn bloom_has_zero_false_negatives() {
        let mut bloom = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bloom.add(format!("member-{i}").as_bytes());
        }
        for i in 0..1000 {
            assert!(bloom.may_contain(format!("member-{i}").as_bytes()));
        }
        // And the false-positive rate stays in a sane band.
        let positives = (0..10_000)
            .filter(|i| bloom.may_contain(format!("absent-{i}").as_bytes()))
            .count();
        assert!(positives < 500, "false positive rate too high: {positives}/10000");
    }

    #[test]
    fn bloom_serialization_round_trips() {
        let mut bloom = BloomFilter::new(100, 0.01);
        for i in 0..100 {
            bloom.add(format!("k{i}").as_bytes());
        }
        let restored = BloomFilter::deserialize(&bloom.serialize()).unwrap();
        for i in 0..100 {
            assert!(restored.may_contain(format!("k{i}").as_bytes()));
        }
    }

    #[test]
    fn filtered_probes_skip_data_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_table(
            dir.path(),
            "t.sst",
            4096,
            &[(b"only", 1, ValueKind::Value, b"v")],
        );
        let reader = TableReader::open(&path).unwrap();
        // Probe keys until the bloom filter rejects one; with one member the
        // table rejects nearly everything.
        let mut filtered = 0;
        for i in 0..64 {
            if reader.get(format!("absent-{i}").as_bytes()).unwrap() == TableLookup::Filtered {
                filtered += 1;
            }
        }
        assert!(filtered > 0, "bloom filter never pruned a probe");
    }

    #[test]
    fn bad_magic_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_table(
            dir.path(),
            "t.sst",
            4096,
            &[(b"k", 1, ValueKind::Value, b"v")],
        );
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(TableReader::open(&path).is_err());
    }

    #[test]
    fn short_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.sst");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(TableReader::open(&path).is_err());
    }

    #[test]
    fn for_each_entry_visits_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_table(
            dir.path(),
            "t.sst",
            32,
            &[
                (b"a", 5, ValueKind::Value, b"1"),
                (b"b", 4, ValueKind::Deletion, b""),
                (b"c", 3, ValueKind::Value, b"3"),
                (b"d", 2, ValueKind::Value, b"4"),
            ],
        );
        let reader = TableReader::open(&path).unwrap();
        let mut seen = Vec::new();
        reader
            .for_each_entry(|key, value| seen.push((key.user_key, key.sequence, value)))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 5, b"1".to_vec()),
                (b"b".to_vec(), 4, Vec::new()),
                (b"c".to_vec(), 3, b"3".to_vec()),
                (b"d".to_vec(), 2, b"4".to_vec()),
            ]
        );
    }
}
