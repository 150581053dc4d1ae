//! In-memory ordered table over the most recent writes.
//!
//! A probabilistic skip list keyed by internal key (user key ascending, then
//! sequence descending, so the newest version of a key sorts first). Nodes
//! live in an owning arena and forward pointers are arena indices; memory is
//! reclaimed in bulk when the table is dropped. Writes are serialized and
//! readers run concurrently behind the list's reader/writer lock, which is
//! held only for the duration of one traversal or splice.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::RwLock;

use rand::Rng;

/// Skip list height cap; heights are drawn geometrically with p = 1/4.
const MAX_HEIGHT: usize = 12;

/// Per-entry overhead charged to the approximate size accounting.
const ENTRY_OVERHEAD: usize = 40;

const NIL: u32 = u32::MAX;

/// Tag distinguishing live values from tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Value = 0x01,
    Deletion = 0x02,
}

impl ValueKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Value),
            0x02 => Some(Self::Deletion),
            _ => None,
        }
    }
}

/// (user key, sequence, kind) — the unit of ordering across the memtable and
/// the on-disk tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: u64,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: Vec<u8>, sequence: u64, kind: ValueKind) -> Self {
        Self {
            user_key,
            sequence,
            kind,
        }
    }

    /// Probe key that sorts before every real entry for `user_key`.
    fn seek(user_key: &[u8]) -> Self {
        Self {
            user_key: user_key.to_vec(),
            sequence: u64::MAX,
            kind: ValueKind::Value,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            // Descending sequence: newest first.
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| (self.kind as u8).cmp(&(other.kind as u8)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of a point lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    Deleted,
    Missing,
}

struct Node {
    key: InternalKey,
    value: Vec<u8>,
    height: usize,
    next: [u32; MAX_HEIGHT],
}

struct SkipCore {
    arena: Vec<Node>,
    max_height: usize,
}

impl SkipCore {
    fn head(&self) -> &Node {
        &self.arena[0]
    }

    /// Index of the first node whose key is >= `key`, or NIL.
    fn find_greater_or_equal(&self, key: &InternalKey) -> u32 {
        let mut current = 0u32;
        for level in (0..self.max_height).rev() {
            loop {
                let next = self.arena[current as usize].next[level];
                if next == NIL || self.arena[next as usize].key >= *key {
                    break;
                }
                current = next;
            }
        }
        self.arena[current as usize].next[0]
    }
}

/// Size-accounted skip-list memtable. `put`/`delete` are serialized; `get`
/// and `for_each` run concurrently with each other.
pub struct MemTable {
    core: RwLock<SkipCore>,
    max_size_bytes: usize,
    approximate_size: AtomicUsize,
    entry_count: AtomicUsize,
}

impl MemTable {
    pub fn new(max_size_bytes: usize) -> Self {
        let head = Node {
            key: InternalKey::new(Vec::new(), 0, ValueKind::Value),
            value: Vec::new(),
            height: MAX_HEIGHT,
            next: [NIL; MAX_HEIGHT],
        };
        Self {
            core: RwLock::new(SkipCore {
                arena: vec![head],
                max_height: 1,
            }),
            max_size_bytes,
            approximate_size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, user_key: &[u8], value: &[u8], sequence: u64) {
        self.insert(
            InternalKey::new(user_key.to_vec(), sequence, ValueKind::Value),
            value.to_vec(),
        );
    }

    pub fn delete(&self, user_key: &[u8], sequence: u64) {
        self.insert(
            InternalKey::new(user_key.to_vec(), sequence, ValueKind::Deletion),
            Vec::new(),
        );
    }

    /// Newest version of `user_key`: a live value, a tombstone, or nothing.
    pub fn get(&self, user_key: &[u8]) -> Lookup {
        let core = self.core.read().unwrap();
        let idx = core.find_greater_or_equal(&InternalKey::seek(user_key));
        if idx == NIL {
            return Lookup::Missing;
        }
        let node = &core.arena[idx as usize];
        if node.key.user_key != user_key {
            return Lookup::Missing;
        }
        match node.key.kind {
            ValueKind::Value => Lookup::Found(node.value.clone()),
            ValueKind::Deletion => Lookup::Deleted,
        }
    }

    /// Visit every entry in ascending internal-key order.
    pub fn for_each(&self, mut cb: impl FnMut(&InternalKey, &[u8])) {
        let core = self.core.read().unwrap();
        let mut idx = core.head().next[0];
        while idx != NIL {
            let node = &core.arena[idx as usize];
            cb(&node.key, &node.value);
            idx = node.next[0];
        }
    }

    pub fn should_flush(&self) -> bool {
        self.approximate_size.load(AtomicOrdering::Relaxed) >= self.max_size_bytes
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.load(AtomicOrdering::Relaxed)
    }

    fn insert(&self, key: InternalKey, value: Vec<u8>) {
        let charged = key.user_key.len() + value.len() + ENTRY_OVERHEAD;
        let mut core = self.core.write().unwrap();

        let mut update = [0u32; MAX_HEIGHT];
        let mut current = 0u32;
        for level in (0..core.max_height).rev() {
            loop {
                let next = core.arena[current as usize].next[level];
                if next == NIL || core.arena[next as usize].key >= key {
                    break;
                }
                current = next;
            }
            update[level] = current;
        }

        let height = random_height();
        if height > core.max_height {
            // New levels descend straight from the head.
            for slot in update.iter_mut().take(height).skip(core.max_height) {
                *slot = 0;
            }
            core.max_height = height;
        }

        let new_idx = core.arena.len() as u32;
        let mut node = Node {
            key,
            value,
            height,
            next: [NIL; MAX_HEIGHT],
        };
        for level in 0..height {
            node.next[level] = core.arena[update[level] as usize].next[level];
        }
        core.arena.push(node);
        for level in 0..height {
            core.arena[update[level] as usize].next[level] = new_idx;
        }

        self.approximate_size
            .fetch_add(charged, AtomicOrdering::Relaxed);
        self.entry_count.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_range(0..4) == 0 {
        height += 1;
    }
    height
}
