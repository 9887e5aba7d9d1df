use tally_crypto::CryptoError;
use tally_protocol::ProtocolError;
use thiserror::Error;

/// Failures of ledger reads, contract execution and commits
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("record {0} does not exist")]
    NotFound(String),

    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("read conflict on {key}: read version {read}, committed version {current}")]
    Conflict { key: String, read: u64, current: u64 },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("missing transient field {0}")]
    MissingTransient(String),

    #[error("bad argument {name}: {reason}")]
    BadArgument { name: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown contract {0}")]
    UnknownContract(String),

    #[error("unknown transaction {contract}.{tx}")]
    UnknownTransaction { contract: String, tx: String },

    #[error("blob {0} is not stored")]
    MissingBlob(String),

    #[error("blob {0} failed content verification")]
    CorruptBlob(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Contention or availability failures worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. } | LedgerError::Unavailable(_))
    }

    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            LedgerError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CryptoError> for LedgerError {
    fn from(e: CryptoError) -> Self {
        LedgerError::Protocol(ProtocolError::Crypto(e))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Decode(e.to_string())
    }
}

impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}
