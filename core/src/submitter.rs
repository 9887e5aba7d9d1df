//! Retrying ledger writes under contention
//!
//! Operators and participants race on the same record ids. A write that loses the
//! MVCC check is retried after a randomized, growing backoff; protocol errors are
//! deterministic and surface immediately.
//!
//! Ledger calls execute contract code and storage I/O synchronously, so each one runs
//! on the blocking pool rather than on a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tally_config::SubmitterConfig;
use thiserror::Error;
use tracing::{error, warn};

use crate::ledger::{Ledger, LedgerError, TransientMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub jitter_step: Duration,
    pub jitter_steps: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SubmitterConfig::default())
    }
}

impl From<&SubmitterConfig> for RetryPolicy {
    fn from(config: &SubmitterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            jitter_step: Duration::from_millis(config.jitter_step_ms),
            jitter_steps: config.jitter_steps,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_steps == 0 {
            0
        } else {
            rng.gen_range(0..self.jitter_steps)
        };
        self.jitter_step * jitter + self.backoff_base * retry
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{contract}.{tx} rejected: {source}")]
    Rejected {
        contract: String,
        tx: String,
        source: LedgerError,
    },

    #[error("{contract}.{tx} still conflicting after {attempts} attempts: {last}")]
    Exhausted {
        contract: String,
        tx: String,
        attempts: u32,
        last: LedgerError,
    },
}

impl SubmitError {
    /// The ledger error behind the failure
    pub fn ledger_error(&self) -> &LedgerError {
        match self {
            SubmitError::Rejected { source, .. } => source,
            SubmitError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.ledger_error(), LedgerError::NotFound(_))
    }
}

/// Submits transactions under one identity
#[derive(Clone)]
pub struct TransactionSubmitter {
    ledger: Arc<dyn Ledger>,
    identity: String,
    policy: RetryPolicy,
}

impl TransactionSubmitter {
    pub fn new(ledger: Arc<dyn Ledger>, identity: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            identity: identity.into(),
            policy,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn submit(
        &self,
        contract: &str,
        tx: &str,
        args: &[String],
        transient: TransientMap,
    ) -> Result<Vec<u8>, SubmitError> {
        let mut retry = 0u32;
        loop {
            match self.attempt(contract, tx, args, transient.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    if retry >= self.policy.max_retries {
                        error!(
                            identity = %self.identity, contract, tx, attempts = retry + 1, error = %e,
                            "giving up"
                        );
                        return Err(SubmitError::Exhausted {
                            contract: contract.into(),
                            tx: tx.into(),
                            attempts: retry + 1,
                            last: e,
                        });
                    }
                    retry += 1;
                    let delay = self.policy.backoff(retry, &mut rand::thread_rng());
                    warn!(
                        identity = %self.identity, contract, tx, retry, delay_ms = delay.as_millis() as u64, error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SubmitError::Rejected {
                        contract: contract.into(),
                        tx: tx.into(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Read-only; never retried
    pub async fn evaluate(&self, contract: &str, tx: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let (ledger, identity) = (self.ledger.clone(), self.identity.clone());
        let (contract, tx, args) = (contract.to_string(), tx.to_string(), args.to_vec());
        tokio::task::spawn_blocking(move || ledger.evaluate(&identity, &contract, &tx, &args))
            .await
            .map_err(ledger_task_failed)?
    }

    async fn attempt(
        &self,
        contract: &str,
        tx: &str,
        args: &[String],
        transient: TransientMap,
    ) -> Result<Vec<u8>, LedgerError> {
        let (ledger, identity) = (self.ledger.clone(), self.identity.clone());
        let (contract, tx, args) = (contract.to_string(), tx.to_string(), args.to_vec());
        tokio::task::spawn_blocking(move || ledger.submit(&identity, &contract, &tx, &args, transient))
            .await
            .map_err(ledger_task_failed)?
    }
}

fn ledger_task_failed(e: tokio::task::JoinError) -> LedgerError {
    LedgerError::Storage(format!("ledger task failed: {e}"))
}
