use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerError;

/// BLAKE3 hash addressing a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobHash(#[serde(with = "hex::serde")] pub [u8; 32]);

impl BlobHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for BlobHash {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|e| LedgerError::Decode(e.to_string()))?;
        Ok(Self(out))
    }
}

/// Content-addressed store for large per-aggregation artifacts
pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<BlobHash, LedgerError>;

    /// Fetch and verify a blob against its hash
    fn get(&self, hash: &BlobHash) -> Result<Vec<u8>, LedgerError>;

    /// Drop a blob; deleting an absent blob is not an error
    fn delete(&self, hash: &BlobHash) -> Result<(), LedgerError>;
}

pub(crate) fn verify(hash: &BlobHash, bytes: Vec<u8>) -> Result<Vec<u8>, LedgerError> {
    if BlobHash::of(&bytes) != *hash {
        return Err(LedgerError::CorruptBlob(hash.to_string()));
    }
    Ok(bytes)
}

pub fn put_json<T: Serialize + ?Sized>(store: &dyn BlobStore, value: &T) -> Result<BlobHash, LedgerError> {
    store.put(&serde_json::to_vec(value)?)
}

/// Hash `value` and store it unless `previous` already holds the same content
pub fn put_json_unless<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    previous: Option<BlobHash>,
    value: &T,
) -> Result<BlobHash, LedgerError> {
    let bytes = serde_json::to_vec(value)?;
    let hash = BlobHash::of(&bytes);
    if previous == Some(hash) {
        return Ok(hash);
    }
    store.put(&bytes)
}

pub fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, hash: &BlobHash) -> Result<T, LedgerError> {
    Ok(serde_json::from_slice(&store.get(hash)?)?)
}
