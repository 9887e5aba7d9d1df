//! Operator role
//!
//! Joins the committee of every query it sees, condenses its mask column once the
//! aggregation closes, and posts the result to the query. The operator that took
//! index 0 also enforces the query deadline on the aggregation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tally_crypto::{LatticeKeyPair, PublicKey};
use tally_protocol::{AggregateResult, AskerPublicKeys, ProtocolError, QueryRecord, QuerySettings, condense};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contracts::{AGGREGATION, AggregationEntry, QUERY, events, transient, tx};
use crate::ledger::{CommitEvent, TransientMap};
use crate::orchestrator::{RoleContext, arm_timer, decode, now_secs};

/// Posts of one unmask contribution before the operator gives up on a query
const CONDENSE_ATTEMPTS: u32 = 3;
const CONDENSE_RETRY: Duration = Duration::from_secs(1);

/// This operator's seat in one query's committee
pub struct OperatorSession {
    keypair: Arc<LatticeKeyPair>,
    index: usize,
    asker: AskerPublicKeys,
    settings: QuerySettings,
    condensed: bool,
    condense_failures: u32,
}

pub struct Operator {
    ctx: RoleContext<OperatorSession>,
    timers: mpsc::UnboundedSender<String>,
    retries: mpsc::UnboundedSender<String>,
}

impl Operator {
    pub fn spawn(ctx: RoleContext<OperatorSession>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut queries = ctx.ledger.subscribe(QUERY);
        let mut aggregations = ctx.ledger.subscribe(AGGREGATION);
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<String>();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<String>();
        let operator = Operator {
            ctx,
            timers: timer_tx,
            retries: retry_tx,
        };

        tokio::spawn(async move {
            info!(identity = %operator.ctx.identity, "operator running");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(event) = queries.next() => {
                        if let Err(e) = operator.on_query_event(event).await {
                            warn!(identity = %operator.ctx.identity, error = %e, "query event dropped");
                        }
                    }
                    Some(event) = aggregations.next() => {
                        if let Err(e) = operator.on_aggregation_event(event).await {
                            warn!(identity = %operator.ctx.identity, error = %e, "aggregation event dropped");
                        }
                    }
                    Some(id) = timer_rx.recv() => operator.on_deadline(id).await,
                    Some(id) = retry_rx.recv() => {
                        if let Err(e) = operator.retry_condense(id).await {
                            warn!(identity = %operator.ctx.identity, error = %e, "unmask retry failed");
                        }
                    }
                    else => break,
                }
            }
            info!(identity = %operator.ctx.identity, "operator stopped");
        })
    }

    async fn on_query_event(&self, event: CommitEvent) -> Result<()> {
        match event.name() {
            Some(events::START_QUERY) => self.join(decode(&event)?).await,
            Some(events::REMOVE_QUERY) => self.forget(decode(&event)?).await,
            _ => Ok(()),
        }
    }

    async fn on_aggregation_event(&self, event: CommitEvent) -> Result<()> {
        match event.name() {
            Some(events::AGGREGATION_CLOSED) => self.condense(decode(&event)?).await,
            _ => Ok(()),
        }
    }

    async fn join(&self, record: QueryRecord) -> Result<()> {
        let id = record.id().to_string();
        let keypair = LatticeKeyPair::generate(record.asker().lattice.params());
        let settings = *record.settings();

        let operator_key = PublicKey::PostQuantumLattice(keypair.public_key().clone());
        let (homomorphic, lattice) = record.asker().tagged();
        let mut fields = TransientMap::new();
        fields.insert(transient::OPERATOR.into(), serde_json::to_vec(&operator_key)?);
        fields.insert(transient::PAILLIER.into(), serde_json::to_vec(&homomorphic)?);
        fields.insert(transient::POST_QUANTUM.into(), serde_json::to_vec(&lattice)?);
        let args = vec![
            id.clone(),
            settings.committee_size.to_string(),
            settings.expected_participants.to_string(),
        ];

        let index: usize = match self
            .ctx
            .submitter
            .submit(AGGREGATION, tx::START, &args, fields)
            .await
        {
            Ok(bytes) => std::str::from_utf8(&bytes)?.parse()?,
            Err(e) if matches!(e.ledger_error().protocol(), Some(ProtocolError::CommitteeFull { .. })) => {
                info!(id = %id, "committee already full");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.ctx.sessions().await.insert(
            id.clone(),
            OperatorSession {
                keypair: Arc::new(keypair),
                index,
                asker: record.asker().clone(),
                settings,
                condensed: false,
                condense_failures: 0,
            },
        );
        info!(id = %id, index, "joined committee");

        if index == 0 {
            let after = Duration::from_secs(record.deadline().saturating_sub(now_secs()));
            arm_timer(&self.timers, id, after);
        }
        Ok(())
    }

    async fn on_deadline(&self, id: String) {
        if !self.ctx.sessions().await.contains_key(&id) {
            return;
        }
        match self
            .ctx
            .submitter
            .submit(AGGREGATION, tx::CLOSE, &[id.clone()], TransientMap::new())
            .await
        {
            Ok(_) => debug!(id = %id, "aggregation deadline reached"),
            Err(e) if e.is_not_found() => debug!(id = %id, "aggregation already removed"),
            Err(e) => warn!(id = %id, error = %e, "deadline close failed"),
        }
    }

    async fn condense(&self, entry: AggregationEntry) -> Result<()> {
        let (keypair, index, asker) = {
            let mut sessions = self.ctx.sessions().await;
            let Some(session) = sessions.get_mut(&entry.id) else {
                return Ok(());
            };
            if session.condensed {
                debug!(id = %entry.id, "already condensed");
                return Ok(());
            }
            if entry.participants == 0 {
                warn!(id = %entry.id, "aggregation closed without participants");
                return Ok(());
            }
            if !entry.is_complete() && !session.settings.allow_partial {
                warn!(
                    id = %entry.id, participants = entry.participants, expected = entry.expected_participants,
                    "partial aggregate, not unmasking"
                );
                return Ok(());
            }
            (session.keypair.clone(), session.index, session.asker.clone())
        };

        match self.post_unmask(&entry, &keypair, index, &asker).await {
            Ok(()) => {
                if let Some(session) = self.ctx.sessions().await.get_mut(&entry.id) {
                    session.condensed = true;
                }
                Ok(())
            }
            Err(e) => {
                let retry = self.ctx.sessions().await.get_mut(&entry.id).is_some_and(|session| {
                    session.condense_failures += 1;
                    session.condense_failures < CONDENSE_ATTEMPTS
                });
                if retry {
                    arm_timer(&self.retries, entry.id.clone(), CONDENSE_RETRY);
                }
                Err(e)
            }
        }
    }

    /// Re-read a closed aggregation whose unmask contribution failed to post
    async fn retry_condense(&self, id: String) -> Result<()> {
        if !self.ctx.sessions().await.contains_key(&id) {
            return Ok(());
        }
        let bytes = self
            .ctx
            .submitter
            .evaluate(AGGREGATION, tx::RETRIEVE, &[id.clone()])
            .await?;
        let entry: AggregationEntry = serde_json::from_slice(&bytes)?;
        debug!(id = %id, "retrying unmask contribution");
        self.condense(entry).await
    }

    async fn post_unmask(
        &self,
        entry: &AggregationEntry,
        keypair: &LatticeKeyPair,
        index: usize,
        asker: &AskerPublicKeys,
    ) -> Result<()> {
        let record = entry.load(self.ctx.blobs.as_ref())?;
        if record.asker() != asker {
            warn!(id = %entry.id, "aggregation asker keys differ from the query's");
            return Ok(());
        }
        if record.operator_index(&self.ctx.identity) != Some(index) {
            warn!(id = %entry.id, index, "committee seat does not match registration");
            return Ok(());
        }

        let contribution = condense(keypair, index, record.masks(), &asker.lattice)?;
        let result = AggregateResult {
            blinded_sum: record
                .blinded_sum()
                .cloned()
                .context("closed aggregation without a blinded sum")?,
            participants: record.participants(),
        };

        let mut fields = TransientMap::new();
        fields.insert(transient::CONTRIBUTION.into(), serde_json::to_vec(&contribution)?);
        fields.insert(transient::RESULT.into(), serde_json::to_vec(&result)?);
        self.ctx
            .submitter
            .submit(QUERY, tx::ADD, &[entry.id.clone()], fields)
            .await?;
        info!(id = %entry.id, index, participants = result.participants, "unmask contribution posted");
        Ok(())
    }

    async fn forget(&self, record: QueryRecord) -> Result<()> {
        let id = record.id().to_string();
        let Some(session) = self.ctx.sessions().await.remove(&id) else {
            return Ok(());
        };
        debug!(id = %id, "query removed, session dropped");
        if session.index != 0 {
            return Ok(());
        }
        match self
            .ctx
            .submitter
            .submit(AGGREGATION, tx::REMOVE, &[id.clone()], TransientMap::new())
            .await
        {
            Ok(_) => info!(id = %id, "aggregation removed"),
            Err(e) if e.is_not_found() => debug!(id = %id, "aggregation already removed"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
