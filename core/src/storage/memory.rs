use std::collections::HashMap;
use std::sync::RwLock;

use crate::ledger::LedgerError;
use crate::storage::blob::{BlobHash, BlobStore, verify};
use crate::storage::state::{StoredEntry, WorldState, Write};

fn poisoned() -> LedgerError {
    LedgerError::Storage("lock poisoned".into())
}

/// In-memory world state
#[derive(Default)]
pub struct MemoryState {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    height: u64,
    entries: HashMap<String, StoredEntry>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorldState for MemoryState {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, LedgerError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.entries.get(key).cloned())
    }

    fn apply(&self, height: u64, writes: &[Write]) -> Result<(), LedgerError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        for (key, value) in writes {
            match value {
                Some(value) => {
                    inner.entries.insert(
                        key.clone(),
                        StoredEntry {
                            version: height,
                            value: value.clone(),
                        },
                    );
                }
                None => {
                    inner.entries.remove(key);
                }
            }
        }
        inner.height = height;
        Ok(())
    }

    fn height(&self) -> Result<u64, LedgerError> {
        Ok(self.inner.read().map_err(|_| poisoned())?.height)
    }
}

/// In-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobHash, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored blob without rehashing (corruption tests)
    #[cfg(test)]
    pub(crate) fn tamper(&self, hash: &BlobHash, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(*hash, bytes);
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobHash, LedgerError> {
        let hash = BlobHash::of(bytes);
        self.blobs
            .write()
            .map_err(|_| poisoned())?
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &BlobHash) -> Result<Vec<u8>, LedgerError> {
        let bytes = self
            .blobs
            .read()
            .map_err(|_| poisoned())?
            .get(hash)
            .cloned()
            .ok_or_else(|| LedgerError::MissingBlob(hash.to_string()))?;
        verify(hash, bytes)
    }

    fn delete(&self, hash: &BlobHash) -> Result<(), LedgerError> {
        self.blobs.write().map_err(|_| poisoned())?.remove(hash);
        Ok(())
    }
}
