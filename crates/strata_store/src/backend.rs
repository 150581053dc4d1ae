//! Storage-backend seam between the coordinator and the engine.
//!
//! The apply path and client reads go through this trait so the routing and
//! command-decoding logic stays testable against an in-memory stand-in.

use std::collections::HashMap;
use std::sync::RwLock;

/// Minimal store surface the coordinator needs.
pub trait StorageBackend: Send + Sync {
    /// Read the newest visible value for `key`; `None` covers both absence
    /// and deletion.
    fn load(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn store(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn remove(&self, key: &[u8]) -> anyhow::Result<()>;
    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()>;
    fn ping(&self) -> bool;
}

/// Hash-map backend for tests.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }

    fn store(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.inner
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> anyhow::Result<()> {
        self.inner.write().unwrap().remove(key);
        Ok(())
    }

    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        for (key, value) in entries {
            inner.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn ping(&self) -> bool {
        true
    }
}
