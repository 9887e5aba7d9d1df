//! Local ledger
//!
//! Contracts run against a [`TxContext`] that buffers writes and records the version of
//! every key it read. Commit re-checks those versions under a single lock, so two
//! transactions that raced on one record cannot both land.
//!
//! ```text
//!  submit ──▶ contract.invoke(ctx) ──▶ read set + write set
//!                                          │
//!                          commit lock ────┤ versions unchanged?
//!                                          │ yes            │ no
//!                                          ▼                ▼
//!                                 apply at height+1     Conflict
//!                                          │                │
//!                                          └──▶ CommitEvent ◀┘ (valid / invalid)
//! ```

pub mod context;
pub mod error;
pub mod local;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

pub use context::TxContext;
pub use error::LedgerError;
pub use local::LocalLedger;

/// Per-transaction payloads that never reach world state
pub type TransientMap = HashMap<String, Vec<u8>>;

/// Delivered to subscribers after every commit attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub contract: String,
    pub tx_id: String,
    pub tx_name: String,
    /// Event name set by the contract, if any
    pub event: Option<String>,
    pub payload: Vec<u8>,
    pub valid: bool,
    pub block: u64,
}

impl CommitEvent {
    /// Name of a valid, named event
    pub fn name(&self) -> Option<&str> {
        if self.valid { self.event.as_deref() } else { None }
    }
}

/// The ledger as seen by a role process
pub trait Ledger: Send + Sync {
    /// Execute and commit a transaction under `identity`
    fn submit(
        &self,
        identity: &str,
        contract: &str,
        tx: &str,
        args: &[String],
        transient: TransientMap,
    ) -> Result<Vec<u8>, LedgerError>;

    /// Execute without committing
    fn evaluate(
        &self,
        identity: &str,
        contract: &str,
        tx: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError>;

    /// Commit events of one contract, from now on
    fn subscribe(&self, contract: &str) -> EventStream;
}

/// Commit events filtered to one contract
pub struct EventStream {
    contract: String,
    inner: BroadcastStream<CommitEvent>,
}

impl EventStream {
    pub fn new(contract: impl Into<String>, rx: broadcast::Receiver<CommitEvent>) -> Self {
        Self {
            contract: contract.into(),
            inner: BroadcastStream::new(rx),
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Next event for this contract; `None` once the ledger is gone
    pub async fn next(&mut self) -> Option<CommitEvent> {
        while let Some(item) = self.inner.next().await {
            match item {
                Ok(event) if event.contract == self.contract => return Some(event),
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(contract = %self.contract, skipped, "event subscriber lagged");
                }
            }
        }
        None
    }
}
