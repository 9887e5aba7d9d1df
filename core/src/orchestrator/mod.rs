//! Role processes
//!
//! Each role owns a [`RoleContext`] for its lifetime and runs one dispatch loop that
//! selects over the contract event streams it cares about and its deadline timers.
//! Record invariants are enforced by the ledger; the session map only tracks which
//! records this process has work pending on.

pub mod asker;
pub mod operator;
pub mod participant;
pub mod sandbox;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tally_config::TallyConfig;
use tokio::sync::{Mutex, MutexGuard, mpsc};

use crate::ledger::{CommitEvent, Ledger};
use crate::storage::BlobStore;
use crate::submitter::{RetryPolicy, TransactionSubmitter};

pub use asker::{AskerHandle, QueryOutcome};
pub use operator::Operator;
pub use participant::{FixedSecret, Participant, RandomSecret, SecretSource};
pub use sandbox::Sandbox;

/// Per-process state shared by a role's loop and its handles
pub struct RoleContext<S> {
    pub identity: String,
    pub ledger: Arc<dyn Ledger>,
    pub blobs: Arc<dyn BlobStore>,
    pub submitter: TransactionSubmitter,
    pub config: Arc<TallyConfig>,
    sessions: Mutex<HashMap<String, S>>,
}

impl<S> RoleContext<S> {
    pub fn new(
        identity: impl Into<String>,
        ledger: Arc<dyn Ledger>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<TallyConfig>,
    ) -> Self {
        let identity = identity.into();
        let submitter = TransactionSubmitter::new(
            ledger.clone(),
            identity.clone(),
            RetryPolicy::from(&config.submitter),
        );
        Self {
            identity,
            ledger,
            blobs,
            submitter,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn sessions(&self) -> MutexGuard<'_, HashMap<String, S>> {
        self.sessions.lock().await
    }
}

/// One-shot, non-cancellable deadline: posts `id` into the loop after `after`
pub(crate) fn arm_timer(timers: &mpsc::UnboundedSender<String>, id: String, after: Duration) {
    let timers = timers.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        // loop already gone
        let _ = timers.send(id);
    });
}

pub(crate) fn decode<T: DeserializeOwned>(event: &CommitEvent) -> Result<T> {
    serde_json::from_slice(&event.payload)
        .with_context(|| format!("malformed {} payload", event.event.as_deref().unwrap_or("event")))
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
