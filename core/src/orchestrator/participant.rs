use std::sync::Arc;

use anyhow::Result;
use num_bigint::{BigUint, RandBigInt};
use tally_protocol::{MaskingGenerator, MaskingParams};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contracts::{AGGREGATION, AggregationEntry, events, transient, tx};
use crate::ledger::{CommitEvent, TransientMap};
use crate::orchestrator::{RoleContext, decode};

/// Where a participant's private value comes from
pub trait SecretSource: Send + Sync {
    fn secret(&self, aggregation: &str, params: &MaskingParams) -> BigUint;
}

/// The same value for every aggregation
pub struct FixedSecret(pub BigUint);

impl SecretSource for FixedSecret {
    fn secret(&self, _aggregation: &str, _params: &MaskingParams) -> BigUint {
        self.0.clone()
    }
}

/// A fresh value drawn from the configured secret domain
pub struct RandomSecret;

impl SecretSource for RandomSecret {
    fn secret(&self, _aggregation: &str, params: &MaskingParams) -> BigUint {
        rand::thread_rng().gen_biguint(params.secret_bits)
    }
}

pub struct Participant {
    ctx: RoleContext<()>,
    source: Arc<dyn SecretSource>,
}

impl Participant {
    pub fn new(ctx: RoleContext<()>, source: Arc<dyn SecretSource>) -> Arc<Self> {
        Arc::new(Self { ctx, source })
    }

    pub fn identity(&self) -> &str {
        &self.ctx.identity
    }

    /// Join every aggregation that starts while running, once each
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut aggregations = self.ctx.ledger.subscribe(AGGREGATION);
        tokio::spawn(async move {
            info!(identity = %self.ctx.identity, "participant running");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(event) = aggregations.next() => {
                        if let Err(e) = self.on_event(event).await {
                            warn!(identity = %self.ctx.identity, error = %e, "contribution failed");
                        }
                    }
                    else => break,
                }
            }
            info!(identity = %self.ctx.identity, "participant stopped");
        })
    }

    async fn on_event(&self, event: CommitEvent) -> Result<()> {
        if event.name() != Some(events::START_AGGREGATING) {
            return Ok(());
        }
        let entry: AggregationEntry = decode(&event)?;
        if entry.committee_size < self.ctx.config.sandbox.min_committee {
            debug!(id = %entry.id, committee = entry.committee_size, "committee too small, skipping");
            return Ok(());
        }
        if self.ctx.sessions().await.insert(entry.id.clone(), ()).is_some() {
            return Ok(());
        }

        let secret = self
            .source
            .secret(&entry.id, &self.ctx.config.crypto.masking_params());
        self.contribute_to(&entry, &secret).await?;
        Ok(())
    }

    /// Mask `secret` for aggregation `id` and add it; returns the participant count
    pub async fn contribute(&self, id: &str, secret: &BigUint) -> Result<usize> {
        let bytes = self
            .ctx
            .submitter
            .evaluate(AGGREGATION, tx::RETRIEVE, &[id.to_string()])
            .await?;
        let entry: AggregationEntry = serde_json::from_slice(&bytes)?;
        self.contribute_to(&entry, secret).await
    }

    async fn contribute_to(&self, entry: &AggregationEntry, secret: &BigUint) -> Result<usize> {
        let params = self.ctx.config.crypto.masking_params();
        // more participants than the bound could wrap the aggregate
        params.check_participants(entry.expected_participants)?;
        let contribution = {
            let record = entry.load(self.ctx.blobs.as_ref())?;
            let operators = record.operator_keys();
            let generator =
                MaskingGenerator::new(&record.asker().homomorphic, &operators, params)?;
            generator.generate(secret)?
        };

        let mut fields = TransientMap::new();
        fields.insert(transient::CONTRIBUTION.into(), serde_json::to_vec(&contribution)?);
        let bytes = self
            .ctx
            .submitter
            .submit(AGGREGATION, tx::ADD, &[entry.id.clone()], fields)
            .await?;
        let participants: usize = std::str::from_utf8(&bytes)?.parse()?;
        info!(id = %entry.id, identity = %self.ctx.identity, participants, "contribution added");
        Ok(participants)
    }
}
