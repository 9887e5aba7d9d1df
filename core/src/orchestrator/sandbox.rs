use std::sync::Arc;

use anyhow::{Context, Result};
use tally_config::{LedgerBackend, TallyConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ledger::{Ledger, LocalLedger};
use crate::orchestrator::{
    AskerHandle, Operator, Participant, RandomSecret, RoleContext, SecretSource,
};
use crate::storage::{BlobStore, MemoryBlobStore, MemoryState, RocksDbStore};

/// Ledger and blob store for the configured backend
pub fn open_ledger(config: &TallyConfig) -> Result<(Arc<dyn Ledger>, Arc<dyn BlobStore>)> {
    let (ledger, blobs) = match config.ledger.backend {
        LedgerBackend::Memory => {
            let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
            let ledger = LocalLedger::new(
                Arc::new(MemoryState::new()),
                blobs.clone(),
                config.ledger.event_capacity,
            )?;
            (ledger, blobs)
        }
        LedgerBackend::Rocksdb => {
            let store = Arc::new(
                RocksDbStore::open(&config.ledger.path)
                    .with_context(|| format!("failed to open ledger at {}", config.ledger.path))?,
            );
            let blobs: Arc<dyn BlobStore> = store.clone();
            let ledger = LocalLedger::new(store, blobs.clone(), config.ledger.event_capacity)?;
            (ledger, blobs)
        }
    };
    let ledger: Arc<dyn Ledger> = Arc::new(ledger);
    Ok((ledger, blobs))
}

fn role_context<S>(
    identity: String,
    ledger: &Arc<dyn Ledger>,
    blobs: &Arc<dyn BlobStore>,
    config: &Arc<TallyConfig>,
) -> RoleContext<S> {
    RoleContext::new(identity, ledger.clone(), blobs.clone(), config.clone())
}

/// Every role in one process, sharing one ledger
pub struct Sandbox {
    ledger: Arc<dyn Ledger>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<TallyConfig>,
    asker: AskerHandle,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Sandbox {
    /// Open the configured ledger and run the configured roles with random secrets
    pub fn launch(config: TallyConfig) -> Result<Self> {
        let (ledger, blobs) = open_ledger(&config)?;
        let sources: Vec<Arc<dyn SecretSource>> = (0..config.sandbox.participants)
            .map(|_| Arc::new(RandomSecret) as Arc<dyn SecretSource>)
            .collect();
        Ok(Self::launch_with(config, ledger, blobs, sources))
    }

    /// Run the asker, `sandbox.operators` operators and one participant per source
    pub fn launch_with(
        config: TallyConfig,
        ledger: Arc<dyn Ledger>,
        blobs: Arc<dyn BlobStore>,
        sources: Vec<Arc<dyn SecretSource>>,
    ) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let (asker, task) = AskerHandle::spawn(
            role_context(config.sandbox.name.clone(), &ledger, &blobs, &config),
            shutdown.clone(),
        );
        tasks.push(task);
        for i in 0..config.sandbox.operators {
            let ctx = role_context(format!("operator-{i}"), &ledger, &blobs, &config);
            tasks.push(Operator::spawn(ctx, shutdown.clone()));
        }
        let participants = sources.len();
        for (i, source) in sources.into_iter().enumerate() {
            let ctx = role_context(format!("participant-{i}"), &ledger, &blobs, &config);
            tasks.push(Participant::new(ctx, source).spawn(shutdown.clone()));
        }
        info!(operators = config.sandbox.operators, participants, "sandbox running");

        Self {
            ledger,
            blobs,
            config,
            asker,
            shutdown,
            tasks,
        }
    }

    pub fn asker(&self) -> &AskerHandle {
        &self.asker
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    /// A participant outside the sandbox loop, for manual contributions
    pub fn participant(&self, identity: &str, source: Arc<dyn SecretSource>) -> Arc<Participant> {
        let ctx = role_context(identity.to_string(), &self.ledger, &self.blobs, &self.config);
        Participant::new(ctx, source)
    }

    /// Stop every role and wait for their loops to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "role task failed");
            }
        }
        info!("sandbox stopped");
    }
}
