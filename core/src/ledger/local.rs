use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::contracts::{AggregationContract, Contract, QueryContract};
use crate::ledger::context::{RwSet, TxContext};
use crate::ledger::{CommitEvent, EventStream, Ledger, LedgerError, TransientMap};
use crate::storage::memory::{MemoryBlobStore, MemoryState};
use crate::storage::state::version_of;
use crate::storage::{BlobStore, WorldState};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Single-node ledger with optimistic concurrency control
pub struct LocalLedger {
    state: Arc<dyn WorldState>,
    blobs: Arc<dyn BlobStore>,
    contracts: HashMap<String, Arc<dyn Contract>>,
    commit_lock: Mutex<()>,
    height: AtomicU64,
    tx_counter: AtomicU64,
    events: broadcast::Sender<CommitEvent>,
}

impl LocalLedger {
    /// Ledger with the aggregation and query contracts installed
    pub fn new(
        state: Arc<dyn WorldState>,
        blobs: Arc<dyn BlobStore>,
        event_capacity: usize,
    ) -> Result<Self, LedgerError> {
        let height = state.height()?;
        Ok(Self::assemble(state, blobs, event_capacity, height))
    }

    pub fn in_memory() -> Self {
        Self::assemble(
            Arc::new(MemoryState::new()),
            Arc::new(MemoryBlobStore::new()),
            DEFAULT_EVENT_CAPACITY,
            0,
        )
    }

    fn assemble(
        state: Arc<dyn WorldState>,
        blobs: Arc<dyn BlobStore>,
        event_capacity: usize,
        height: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state,
            blobs,
            contracts: HashMap::new(),
            commit_lock: Mutex::new(()),
            height: AtomicU64::new(height),
            tx_counter: AtomicU64::new(0),
            events,
        }
        .with_contract(Arc::new(AggregationContract))
        .with_contract(Arc::new(QueryContract))
    }

    pub fn with_contract(mut self, contract: Arc<dyn Contract>) -> Self {
        self.contracts.insert(contract.name().to_string(), contract);
        self
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn contract(&self, name: &str) -> Result<&Arc<dyn Contract>, LedgerError> {
        self.contracts
            .get(name)
            .ok_or_else(|| LedgerError::UnknownContract(name.into()))
    }

    fn execute(
        &self,
        identity: &str,
        contract: &str,
        tx: &str,
        args: &[String],
        transient: &TransientMap,
        tx_id: &str,
    ) -> Result<(Vec<u8>, RwSet), LedgerError> {
        let handler = self.contract(contract)?;
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        let mut ctx = TxContext::new(
            contract,
            tx_id,
            identity,
            timestamp,
            self.state.as_ref(),
            self.blobs.as_ref(),
            transient,
        );
        match handler.invoke(&mut ctx, tx, args) {
            Ok(response) => Ok((response, ctx.into_rw_set())),
            Err(LedgerError::MissingBlob(hash)) => {
                // a concurrent commit released blobs this snapshot still referenced
                self.check_reads(&ctx.into_rw_set().reads)?;
                Err(LedgerError::MissingBlob(hash))
            }
            Err(e) => Err(e),
        }
    }

    fn check_reads(&self, reads: &HashMap<String, u64>) -> Result<(), LedgerError> {
        for (key, read) in reads {
            let current = version_of(&self.state.get(key)?);
            if current != *read {
                return Err(LedgerError::Conflict {
                    key: key.clone(),
                    read: *read,
                    current,
                });
            }
        }
        Ok(())
    }

    fn commit(&self, contract: &str, tx: &str, tx_id: String, rw: RwSet) -> Result<u64, LedgerError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| LedgerError::Unavailable("commit lock poisoned".into()))?;

        if let Err(e) = self.check_reads(&rw.reads) {
            let block = self.height.load(Ordering::SeqCst);
            debug!(tx_id = %tx_id, error = %e, "mvcc conflict");
            self.publish(CommitEvent {
                contract: contract.into(),
                tx_id,
                tx_name: tx.into(),
                event: None,
                payload: Vec::new(),
                valid: false,
                block,
            });
            return Err(e);
        }

        let block = self.height.load(Ordering::SeqCst) + 1;
        self.state.apply(block, &rw.writes)?;
        self.height.store(block, Ordering::SeqCst);

        for hash in &rw.released {
            if let Err(e) = self.blobs.delete(hash) {
                warn!(tx_id = %tx_id, blob = %hash, error = %e, "failed to release blob");
            }
        }

        let (event, payload) = match rw.event {
            Some((name, payload)) => (Some(name), payload),
            None => (None, Vec::new()),
        };
        self.publish(CommitEvent {
            contract: contract.into(),
            tx_id,
            tx_name: tx.into(),
            event,
            payload,
            valid: true,
            block,
        });
        Ok(block)
    }

    fn publish(&self, event: CommitEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Ledger for LocalLedger {
    fn submit(
        &self,
        identity: &str,
        contract: &str,
        tx: &str,
        args: &[String],
        transient: TransientMap,
    ) -> Result<Vec<u8>, LedgerError> {
        let tx_id = format!("tx-{}", self.tx_counter.fetch_add(1, Ordering::SeqCst));
        let (response, rw) = self.execute(identity, contract, tx, args, &transient, &tx_id)?;
        if rw.writes.is_empty() && rw.event.is_none() && rw.released.is_empty() {
            return Ok(response);
        }
        match self.commit(contract, tx, tx_id.clone(), rw) {
            Ok(block) => {
                debug!(tx_id = %tx_id, contract, tx, block, "committed");
                Ok(response)
            }
            Err(e) => {
                if !e.is_transient() {
                    warn!(tx_id = %tx_id, contract, tx, error = %e, "commit failed");
                }
                Err(e)
            }
        }
    }

    fn evaluate(
        &self,
        identity: &str,
        contract: &str,
        tx: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError> {
        let tx_id = format!("eval-{}", self.tx_counter.fetch_add(1, Ordering::SeqCst));
        let (response, _) = self.execute(identity, contract, tx, args, &TransientMap::new(), &tx_id)?;
        Ok(response)
    }

    fn subscribe(&self, contract: &str) -> EventStream {
        EventStream::new(contract, self.events.subscribe())
    }
}
