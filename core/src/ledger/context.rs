use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ledger::{LedgerError, TransientMap};
use crate::storage::blob::{BlobHash, BlobStore};
use crate::storage::state::{WorldState, Write, version_of};

/// Everything a contract may touch while executing one transaction.
///
/// Keys are namespaced per contract. Reads see this transaction's own buffered writes
/// first; reads that reach world state record the version they observed.
pub struct TxContext<'a> {
    contract: &'a str,
    tx_id: &'a str,
    identity: &'a str,
    timestamp: u64,
    state: &'a dyn WorldState,
    blobs: &'a dyn BlobStore,
    transient: &'a TransientMap,
    reads: HashMap<String, u64>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
    event: Option<(String, Vec<u8>)>,
    released: Vec<BlobHash>,
}

/// What an executed transaction asks the ledger to commit
#[derive(Debug, Default)]
pub struct RwSet {
    pub reads: HashMap<String, u64>,
    pub writes: Vec<Write>,
    pub event: Option<(String, Vec<u8>)>,
    /// Blobs to drop once the write set is committed
    pub released: Vec<BlobHash>,
}

impl<'a> TxContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: &'a str,
        tx_id: &'a str,
        identity: &'a str,
        timestamp: u64,
        state: &'a dyn WorldState,
        blobs: &'a dyn BlobStore,
        transient: &'a TransientMap,
    ) -> Self {
        Self {
            contract,
            tx_id,
            identity,
            timestamp,
            state,
            blobs,
            transient,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            event: None,
            released: Vec::new(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.contract, key)
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        let key = self.key(key);
        if let Some(buffered) = self.writes.get(&key) {
            return Ok(buffered.clone());
        }
        let entry = self.state.get(&key)?;
        self.reads.entry(key).or_insert_with(|| version_of(&entry));
        Ok(entry.map(|e| e.value))
    }

    pub fn exists(&mut self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        let key = self.key(key);
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        let key = self.key(key);
        self.writes.insert(key, None);
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, LedgerError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), LedgerError> {
        self.put(key, serde_json::to_vec(value)?);
        Ok(())
    }

    pub fn transient(&self, field: &str) -> Result<&[u8], LedgerError> {
        self.transient
            .get(field)
            .map(Vec::as_slice)
            .ok_or_else(|| LedgerError::MissingTransient(field.into()))
    }

    pub fn transient_json<T: DeserializeOwned>(&self, field: &str) -> Result<T, LedgerError> {
        Ok(serde_json::from_slice(self.transient(field)?)?)
    }

    pub fn identity(&self) -> &str {
        self.identity
    }

    /// Unix seconds, fixed for the whole transaction
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn tx_id(&self) -> &str {
        self.tx_id
    }

    /// At most one event per transaction; the last call wins
    pub fn set_event(&mut self, name: &str, payload: Vec<u8>) {
        self.event = Some((name.into(), payload));
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs
    }

    /// Delete `hash` from the blob store if, and only if, this transaction commits
    pub fn release_blob(&mut self, hash: BlobHash) {
        if !self.released.contains(&hash) {
            self.released.push(hash);
        }
    }

    pub fn into_rw_set(self) -> RwSet {
        RwSet {
            reads: self.reads,
            writes: self.writes.into_iter().collect(),
            event: self.event,
            released: self.released,
        }
    }
}
