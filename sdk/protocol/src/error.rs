use tally_crypto::CryptoError;
use thiserror::Error;

/// Protocol failures; none of them leave a record partially mutated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{operation} is not allowed while the {record} record is {state}")]
    InvalidState {
        record: &'static str,
        operation: &'static str,
        state: &'static str,
    },

    #[error("operator committee is full ({committee_size} members)")]
    CommitteeFull { committee_size: usize },

    #[error("operator {0} is already registered")]
    DuplicateOperator(String),

    #[error("mask row has {got} entries, committee has {expected}")]
    MaskRowWidth { expected: usize, got: usize },

    #[error("operator {0} already posted its unmask contribution")]
    DuplicateContribution(usize),

    #[error("operator index {index} out of range for a committee of {committee_size}")]
    IndexOutOfRange { index: usize, committee_size: usize },

    #[error("aggregate covers {participants} of {expected} participants and partial unmasking is disabled")]
    PartialAggregate { participants: usize, expected: usize },

    #[error("query {0} is not ready")]
    NotReady(String),

    #[error("{identity} may not {operation} a query created by {creator}")]
    Unauthorized {
        identity: String,
        operation: &'static str,
        creator: String,
    },

    #[error("secret does not fit in {bits} bits")]
    SecretOutOfRange { bits: u64 },

    #[error("masking parameters exceed capacity: {0}")]
    Capacity(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("inconsistent result: {0}")]
    InconsistentResult(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    /// Operation illegal in the record's current state
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidState { .. } | ProtocolError::NotReady(_)
        )
    }

    /// Slot, width or duplicate-index violation
    pub fn is_capacity_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::CommitteeFull { .. }
                | ProtocolError::DuplicateOperator(_)
                | ProtocolError::MaskRowWidth { .. }
                | ProtocolError::DuplicateContribution(_)
                | ProtocolError::IndexOutOfRange { .. }
        )
    }
}
