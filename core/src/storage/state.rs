use wincode::{SchemaRead, SchemaWrite};

use crate::ledger::LedgerError;

/// A world-state value and the block height that last wrote it
#[derive(Debug, Clone, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct StoredEntry {
    pub version: u64,
    pub value: Vec<u8>,
}

/// One key of a committed write set; `None` deletes
pub type Write = (String, Option<Vec<u8>>);

/// decoupling the ledger from the db
pub trait WorldState: Send + Sync {
    /// Current entry for `key`, if any
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, LedgerError>;

    /// Apply a whole write set at `height`; all or nothing
    fn apply(&self, height: u64, writes: &[Write]) -> Result<(), LedgerError>;

    /// Height of the last applied write set
    fn height(&self) -> Result<u64, LedgerError>;
}

/// Version a reader observes for `key`; absent keys read as version 0
pub fn version_of(entry: &Option<StoredEntry>) -> u64 {
    entry.as_ref().map(|e| e.version).unwrap_or(0)
}
