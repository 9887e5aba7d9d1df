//! Asker role
//!
//! Starts queries, closes the ones that miss their deadline, and unmasks the aggregate
//! once every operator has posted its contribution. Driven through [`AskerHandle`] the
//! way the pipeline service is driven through its command channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use num_bigint::BigUint;
use tally_protocol::{AskerKeys, ProtocolError, QueryRecord, QuerySettings, QueryState, unmask};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contracts::{QUERY, events, transient, tx};
use crate::ledger::{CommitEvent, LedgerError, TransientMap};
use crate::orchestrator::{RoleContext, arm_timer, decode};

/// Keys of a query this asker started
pub struct AskerSession {
    keys: Arc<AskerKeys>,
}

/// What the asker learned about a query
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub id: String,
    pub state: QueryState,
    pub participants: usize,
    pub inconsistent: bool,
    /// Present once every operator contributed and this asker holds the keys
    pub sum: Option<Result<BigUint, ProtocolError>>,
}

enum AskerCommand {
    Start(QuerySettings, oneshot::Sender<Result<String>>),
    Close(String, oneshot::Sender<Result<QueryOutcome>>),
    Retrieve(String, oneshot::Sender<Result<QueryOutcome>>),
    Remove(String, oneshot::Sender<Result<()>>),
    Exists(String, oneshot::Sender<Result<bool>>),
}

struct Asker {
    ctx: RoleContext<AskerSession>,
    counter: u64,
    timers: mpsc::UnboundedSender<String>,
    outcomes: broadcast::Sender<QueryOutcome>,
}

impl Asker {
    async fn handle(&mut self, command: AskerCommand) {
        match command {
            AskerCommand::Start(settings, reply) => {
                let _ = reply.send(self.start(settings).await);
            }
            AskerCommand::Close(id, reply) => {
                let _ = reply.send(self.close(&id).await);
            }
            AskerCommand::Retrieve(id, reply) => {
                let _ = reply.send(self.retrieve(&id).await);
            }
            AskerCommand::Remove(id, reply) => {
                let _ = reply.send(self.remove(&id).await);
            }
            AskerCommand::Exists(id, reply) => {
                let _ = reply.send(self.exists(&id).await);
            }
        }
    }

    async fn next_id(&mut self) -> Result<String> {
        loop {
            let id = format!("{}-{}", self.ctx.identity, self.counter);
            self.counter += 1;
            if !self.exists(&id).await? {
                return Ok(id);
            }
        }
    }

    async fn start(&mut self, settings: QuerySettings) -> Result<String> {
        settings.validate()?;
        let crypto = &self.ctx.config.crypto;
        let bits = crypto.homomorphic_bits;
        let lattice = crypto.lattice_params()?;
        let masking = crypto.masking_params();
        masking.check_capacity(bits, settings.committee_size)?;
        masking.check_participants(settings.expected_participants)?;

        let id = self.next_id().await?;
        let keys = tokio::task::spawn_blocking(move || AskerKeys::generate(bits, lattice))
            .await
            .context("key generation panicked")??;

        let (homomorphic, lattice) = keys.public().tagged();
        let mut fields = TransientMap::new();
        fields.insert(transient::PAILLIER.into(), serde_json::to_vec(&homomorphic)?);
        fields.insert(transient::POST_QUANTUM.into(), serde_json::to_vec(&lattice)?);
        let args = vec![
            id.clone(),
            settings.committee_size.to_string(),
            settings.expected_participants.to_string(),
            settings.duration_secs.to_string(),
            settings.allow_partial.to_string(),
        ];
        self.ctx
            .submitter
            .submit(QUERY, tx::START, &args, fields)
            .await?;

        self.ctx.sessions().await.insert(
            id.clone(),
            AskerSession {
                keys: Arc::new(keys),
            },
        );
        let deadline = Duration::from_secs(settings.duration_secs) + self.ctx.config.query.grace();
        arm_timer(&self.timers, id.clone(), deadline);
        info!(id = %id, committee = settings.committee_size, expected = settings.expected_participants, "query started");
        Ok(id)
    }

    async fn outcome(&self, record: &QueryRecord) -> QueryOutcome {
        let keys = self
            .ctx
            .sessions()
            .await
            .get(record.id())
            .map(|s| s.keys.clone());
        let complete = record.contribution_count() == record.settings().committee_size;
        let sum = match (keys, record.result()) {
            (Some(keys), Some(result)) if complete => {
                Some(unmask(&keys, &result.blinded_sum, &record.contributions()))
            }
            _ => None,
        };
        QueryOutcome {
            id: record.id().to_string(),
            state: record.state(),
            participants: record.result().map(|r| r.participants).unwrap_or(0),
            inconsistent: record.is_inconsistent(),
            sum,
        }
    }

    async fn submit_for_record(&self, name: &str, id: &str) -> Result<QueryRecord> {
        let bytes = self
            .ctx
            .submitter
            .submit(QUERY, name, &[id.to_string()], TransientMap::new())
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn close(&self, id: &str) -> Result<QueryOutcome> {
        let record = self.submit_for_record(tx::CLOSE, id).await?;
        Ok(self.outcome(&record).await)
    }

    async fn retrieve(&self, id: &str) -> Result<QueryOutcome> {
        let record = self.submit_for_record(tx::RETRIEVE, id).await?;
        Ok(self.outcome(&record).await)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.ctx
            .submitter
            .submit(QUERY, tx::REMOVE, &[id.to_string()], TransientMap::new())
            .await?;
        self.ctx.sessions().await.remove(id);
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let answer = self
            .ctx
            .submitter
            .evaluate(QUERY, tx::EXISTS, &[id.to_string()])
            .await?;
        Ok(answer == b"true")
    }

    async fn on_event(&self, event: CommitEvent) -> Result<()> {
        if event.name() != Some(events::DONE_QUERY) {
            return Ok(());
        }
        let record: QueryRecord = decode(&event)?;
        let id = record.id().to_string();
        if !self.ctx.sessions().await.contains_key(&id) {
            return Ok(());
        }

        // reading a DONE record closes it
        let record = match self.submit_for_record(tx::RETRIEVE, &id).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(id = %id, error = %e, "retrieve after done failed");
                record
            }
        };

        let outcome = self.outcome(&record).await;
        match &outcome.sum {
            Some(Ok(sum)) => info!(id = %id, sum = %sum, participants = outcome.participants, "aggregate recovered"),
            Some(Err(e)) => error!(id = %id, error = %e, "unmasking failed"),
            None => {}
        }
        if outcome.inconsistent {
            warn!(id = %id, "operators reported differing aggregates");
        }
        let _ = self.outcomes.send(outcome);
        Ok(())
    }

    async fn on_deadline(&self, id: String) {
        match self
            .ctx
            .submitter
            .evaluate(QUERY, tx::RETRIEVE, &[id.clone()])
            .await
        {
            Err(LedgerError::Protocol(ProtocolError::NotReady(_))) => {
                warn!(id = %id, "deadline passed before every operator reported, closing");
                match self.close(&id).await {
                    Ok(outcome) => {
                        let _ = self.outcomes.send(outcome);
                    }
                    Err(e) => warn!(id = %id, error = %e, "deadline close failed"),
                }
            }
            Ok(_) => debug!(id = %id, "query finished before its deadline"),
            Err(LedgerError::NotFound(_)) => debug!(id = %id, "query removed before its deadline"),
            Err(e) => warn!(id = %id, error = %e, "deadline check failed"),
        }
    }
}

/// Client side of a running asker
#[derive(Clone)]
pub struct AskerHandle {
    command_tx: mpsc::Sender<AskerCommand>,
    outcomes: broadcast::Sender<QueryOutcome>,
    defaults: QuerySettings,
}

impl AskerHandle {
    /// Spawn the asker loop; it stops when `shutdown` is cancelled
    pub fn spawn(ctx: RoleContext<AskerSession>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (command_tx, mut command_rx) = mpsc::channel::<AskerCommand>(64);
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<String>();
        let (outcomes, _) = broadcast::channel(64);
        let mut events = ctx.ledger.subscribe(QUERY);
        let defaults = ctx.config.query.settings();

        let mut asker = Asker {
            ctx,
            counter: 0,
            timers: timer_tx,
            outcomes: outcomes.clone(),
        };

        let task = tokio::spawn(async move {
            info!(identity = %asker.ctx.identity, "asker running");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(command) = command_rx.recv() => asker.handle(command).await,
                    Some(event) = events.next() => {
                        if let Err(e) = asker.on_event(event).await {
                            warn!(error = %e, "query event dropped");
                        }
                    }
                    Some(id) = timer_rx.recv() => asker.on_deadline(id).await,
                    else => break,
                }
            }
            info!(identity = %asker.ctx.identity, "asker stopped");
        });

        (
            Self {
                command_tx,
                outcomes,
                defaults,
            },
            task,
        )
    }

    pub fn outcomes(&self) -> broadcast::Receiver<QueryOutcome> {
        self.outcomes.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> AskerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .ok()
            .context("asker unavailable")?;
        reply_rx.await.context("asker crashed")?
    }

    /// Start a query with the configured settings
    pub async fn start(&self) -> Result<String> {
        self.start_with(self.defaults).await
    }

    pub async fn start_with(&self, settings: QuerySettings) -> Result<String> {
        self.request(|reply| AskerCommand::Start(settings, reply)).await
    }

    pub async fn close(&self, id: &str) -> Result<QueryOutcome> {
        let id = id.to_string();
        self.request(|reply| AskerCommand::Close(id, reply)).await
    }

    pub async fn retrieve(&self, id: &str) -> Result<QueryOutcome> {
        let id = id.to_string();
        self.request(|reply| AskerCommand::Retrieve(id, reply)).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| AskerCommand::Remove(id, reply)).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| AskerCommand::Exists(id, reply)).await
    }
}
