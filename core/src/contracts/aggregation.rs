use serde::{Deserialize, Serialize};
use tally_crypto::{LatticeCiphertext, PaillierCiphertext, PublicKey};
use tally_protocol::{
    AggregationRecord, AggregationState, AskerPublicKeys, MaskMatrix, MaskedContribution,
    OperatorSlot,
};
use tracing::info;

use crate::contracts::{AGGREGATION, Contract, arg, events, parse_arg, transient, tx};
use crate::ledger::{LedgerError, TxContext};
use crate::storage::blob::{BlobHash, BlobStore, get_json, put_json, put_json_unless};

/// World-state form of an aggregation; bulky parts live in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationEntry {
    pub id: String,
    pub committee_size: usize,
    pub expected_participants: usize,
    pub participants: usize,
    pub state: AggregationState,
    pub blinded_sum: Option<PaillierCiphertext>,
    pub asker: BlobHash,
    pub operators: BlobHash,
    /// One blob per mask matrix row, in arrival order
    pub rows: Vec<BlobHash>,
}

impl AggregationEntry {
    /// Store the parts of `record` that `previous` does not already hold.
    ///
    /// The asker keys never change, the operator list only while selecting, and mask
    /// rows are append-only, so an Add writes exactly one new blob.
    pub fn store(
        record: &AggregationRecord,
        previous: Option<&AggregationEntry>,
        blobs: &dyn BlobStore,
    ) -> Result<Self, LedgerError> {
        let asker = match previous {
            Some(previous) => previous.asker,
            None => put_json(blobs, record.asker())?,
        };
        let operators = put_json_unless(blobs, previous.map(|p| p.operators), record.operators())?;

        let mut rows = previous.map(|p| p.rows.clone()).unwrap_or_default();
        let stored = record.masks().rows();
        if rows.len() > stored.len() {
            return Err(LedgerError::Decode(format!(
                "aggregation {} lost mask rows",
                record.id()
            )));
        }
        for row in &stored[rows.len()..] {
            rows.push(put_json(blobs, row)?);
        }

        Ok(Self {
            id: record.id().to_string(),
            committee_size: record.committee_size(),
            expected_participants: record.expected_participants(),
            participants: record.participants(),
            state: record.state(),
            blinded_sum: record.blinded_sum().cloned(),
            asker,
            operators,
            rows,
        })
    }

    /// Every blob this entry references
    pub fn blobs(&self) -> Vec<BlobHash> {
        let mut hashes = vec![self.asker, self.operators];
        hashes.extend(self.rows.iter().copied());
        hashes
    }

    pub fn load(&self, blobs: &dyn BlobStore) -> Result<AggregationRecord, LedgerError> {
        let asker: AskerPublicKeys = get_json(blobs, &self.asker)?;
        let operators: Vec<OperatorSlot> = get_json(blobs, &self.operators)?;
        let rows = self
            .rows
            .iter()
            .map(|hash| get_json::<Vec<LatticeCiphertext>>(blobs, hash))
            .collect::<Result<Vec<_>, _>>()?;
        let masks = MaskMatrix::from_rows(self.committee_size, rows)?;
        Ok(AggregationRecord::from_parts(
            self.id.clone(),
            self.committee_size,
            self.expected_participants,
            asker,
            operators,
            self.blinded_sum.clone(),
            masks,
            self.state,
        )?)
    }

    /// Participants folded in so far matches the expected count
    pub fn is_complete(&self) -> bool {
        self.participants == self.expected_participants
    }
}

pub struct AggregationContract;

impl AggregationContract {
    fn read(ctx: &mut TxContext<'_>, id: &str) -> Result<AggregationEntry, LedgerError> {
        ctx.get_json(id)?
            .ok_or_else(|| LedgerError::NotFound(id.into()))
    }

    fn write(
        ctx: &mut TxContext<'_>,
        record: &AggregationRecord,
        previous: Option<&AggregationEntry>,
    ) -> Result<AggregationEntry, LedgerError> {
        let entry = AggregationEntry::store(record, previous, ctx.blobs())?;
        if let Some(previous) = previous.filter(|p| p.operators != entry.operators) {
            ctx.release_blob(previous.operators);
        }
        ctx.put_json(record.id(), &entry)?;
        Ok(entry)
    }

    /// Register the calling operator, creating the record on first registration.
    /// Returns the operator's committee index.
    fn start(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let operator: PublicKey = ctx.transient_json(transient::OPERATOR)?;
        let operator = operator.as_lattice()?.clone();

        let previous = ctx.get_json::<AggregationEntry>(id)?;
        let mut record = match &previous {
            Some(entry) => entry.load(ctx.blobs())?,
            None => {
                let committee_size: usize = parse_arg(args, 1, "committee_size")?;
                let expected: usize = parse_arg(args, 2, "expected_participants")?;
                let homomorphic: PublicKey = ctx.transient_json(transient::PAILLIER)?;
                let lattice: PublicKey = ctx.transient_json(transient::POST_QUANTUM)?;
                let asker = AskerPublicKeys::from_tagged(&homomorphic, &lattice)?;
                AggregationRecord::new(id, committee_size, expected, asker)?
            }
        };

        let identity = ctx.identity().to_string();
        let (index, transition) = record.register(identity.as_str(), operator)?;
        let entry = Self::write(ctx, &record, previous.as_ref())?;
        if transition.entered(AggregationState::Aggregating) {
            info!(id, committee = entry.committee_size, "committee complete");
            ctx.set_event(events::START_AGGREGATING, serde_json::to_vec(&entry)?);
        }
        Ok(index.to_string().into_bytes())
    }

    fn add(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let contribution: MaskedContribution = ctx.transient_json(transient::CONTRIBUTION)?;

        let previous = Self::read(ctx, id)?;
        let mut record = previous.load(ctx.blobs())?;
        let transition = record.add(contribution)?;
        let entry = Self::write(ctx, &record, Some(&previous))?;
        if transition.entered(AggregationState::Closed) {
            info!(id, participants = entry.participants, "aggregation complete");
            ctx.set_event(events::AGGREGATION_CLOSED, serde_json::to_vec(&entry)?);
        }
        Ok(entry.participants.to_string().into_bytes())
    }

    fn close(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let entry = Self::read(ctx, id)?;
        if entry.state == AggregationState::Closed {
            return Ok(serde_json::to_vec(&entry)?);
        }

        let mut record = entry.load(ctx.blobs())?;
        record.close();
        let entry = Self::write(ctx, &record, Some(&entry))?;
        info!(id, participants = entry.participants, "aggregation closed early");
        let payload = serde_json::to_vec(&entry)?;
        ctx.set_event(events::AGGREGATION_CLOSED, payload.clone());
        Ok(payload)
    }

    fn retrieve(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        Ok(serde_json::to_vec(&Self::read(ctx, id)?)?)
    }

    fn remove(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let entry = Self::read(ctx, id)?;
        ctx.delete(id);
        for hash in entry.blobs() {
            ctx.release_blob(hash);
        }
        Ok(Vec::new())
    }
}

impl Contract for AggregationContract {
    fn name(&self) -> &'static str {
        AGGREGATION
    }

    fn invoke(&self, ctx: &mut TxContext<'_>, name: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        match name {
            tx::START => Self::start(ctx, args),
            tx::ADD => Self::add(ctx, args),
            tx::CLOSE => Self::close(ctx, args),
            tx::RETRIEVE => Self::retrieve(ctx, args),
            tx::REMOVE => Self::remove(ctx, args),
            tx::EXISTS => {
                let id = arg(args, 0, "id")?;
                Ok(super::flag(ctx.exists(id)?))
            }
            other => Err(LedgerError::UnknownTransaction {
                contract: AGGREGATION.into(),
                tx: other.into(),
            }),
        }
    }
}
