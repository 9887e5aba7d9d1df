use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

use crate::ledger::LedgerError;
use crate::storage::blob::{BlobHash, BlobStore, verify};
use crate::storage::state::{StoredEntry, WorldState, Write};

const CF_WORLD_STATE: &str = "world_state";
const CF_BLOBS: &str = "blobs";
const CF_META: &str = "meta";

const HEIGHT_KEY: &[u8] = b"height";

/// A thread-safe wrapper around RocksDB holding world state and blobs.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    /// Opens the database at the specified path, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = vec![
            ColumnFamilyDescriptor::new(CF_WORLD_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOBS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, families)
            .map_err(|e| LedgerError::Storage(format!("Failed to open RocksDB: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("{name} CF missing")))
    }
}

impl WorldState for RocksDbStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, LedgerError> {
        let cf = self.cf(CF_WORLD_STATE)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let entry: StoredEntry = wincode::deserialize(&bytes)
                    .map_err(|e| LedgerError::Storage(format!("corrupt entry {key}: {e}")))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn apply(&self, height: u64, writes: &[Write]) -> Result<(), LedgerError> {
        let state = self.cf(CF_WORLD_STATE)?;
        let meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    let entry = StoredEntry {
                        version: height,
                        value: value.clone(),
                    };
                    let bytes = wincode::serialize(&entry)
                        .map_err(|e| LedgerError::Storage(e.to_string()))?;
                    batch.put_cf(state, key.as_bytes(), bytes);
                }
                None => batch.delete_cf(state, key.as_bytes()),
            }
        }
        batch.put_cf(meta, HEIGHT_KEY, height.to_be_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    fn height(&self) -> Result<u64, LedgerError> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(meta, HEIGHT_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LedgerError::Storage("corrupt height".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }
}

impl BlobStore for RocksDbStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobHash, LedgerError> {
        let cf = self.cf(CF_BLOBS)?;
        let hash = BlobHash::of(bytes);
        self.db.put_cf(cf, hash.0, bytes)?;
        Ok(hash)
    }

    fn get(&self, hash: &BlobHash) -> Result<Vec<u8>, LedgerError> {
        let cf = self.cf(CF_BLOBS)?;
        let bytes = self
            .db
            .get_cf(cf, hash.0)?
            .ok_or_else(|| LedgerError::MissingBlob(hash.to_string()))?;
        verify(hash, bytes)
    }

    fn delete(&self, hash: &BlobHash) -> Result<(), LedgerError> {
        let cf = self.cf(CF_BLOBS)?;
        self.db.delete_cf(cf, hash.0)?;
        Ok(())
    }
}
