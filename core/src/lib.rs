//! Tally core: the ledger the roles coordinate through, the retrying submitter, and
//! the asker, operator and participant processes.

pub mod contracts;
pub mod ledger;
pub mod orchestrator;
pub mod storage;
pub mod submitter;

pub use ledger::{CommitEvent, EventStream, Ledger, LedgerError, LocalLedger, TransientMap};
pub use orchestrator::{AskerHandle, QueryOutcome, Sandbox};
pub use submitter::{RetryPolicy, SubmitError, TransactionSubmitter};

#[cfg(test)]
mod tests;
