use tally_crypto::PublicKey;
use tally_protocol::{
    AggregateResult, AskerPublicKeys, QueryRecord, QuerySettings, QueryState, UnmaskContribution,
};
use tracing::info;

use crate::contracts::{Contract, QUERY, arg, events, flag, parse_arg, transient, tx};
use crate::ledger::{LedgerError, TxContext};

pub struct QueryContract;

impl QueryContract {
    fn read(ctx: &mut TxContext<'_>, id: &str) -> Result<QueryRecord, LedgerError> {
        ctx.get_json(id)?
            .ok_or_else(|| LedgerError::NotFound(id.into()))
    }

    /// args: id, committee size, expected participants, duration secs, allow partial
    fn start(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let settings = QuerySettings {
            committee_size: parse_arg(args, 1, "committee_size")?,
            expected_participants: parse_arg(args, 2, "expected_participants")?,
            duration_secs: parse_arg(args, 3, "duration_secs")?,
            allow_partial: match args.get(4) {
                Some(_) => parse_arg(args, 4, "allow_partial")?,
                None => false,
            },
        };
        if ctx.exists(id)? {
            return Err(LedgerError::AlreadyExists(id.into()));
        }

        let homomorphic: PublicKey = ctx.transient_json(transient::PAILLIER)?;
        let lattice: PublicKey = ctx.transient_json(transient::POST_QUANTUM)?;
        let asker = AskerPublicKeys::from_tagged(&homomorphic, &lattice)?;

        let record = QueryRecord::new(id, settings, ctx.identity(), ctx.timestamp(), asker)?;
        let payload = serde_json::to_vec(&record)?;
        ctx.put(id, payload.clone());
        ctx.set_event(events::START_QUERY, payload.clone());
        info!(id, committee = settings.committee_size, "query started");
        Ok(payload)
    }

    fn add(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let contribution: UnmaskContribution = ctx.transient_json(transient::CONTRIBUTION)?;
        let result: AggregateResult = ctx.transient_json(transient::RESULT)?;

        let mut record = Self::read(ctx, id)?;
        let transition = record.register_unmask(contribution, result)?;
        let payload = serde_json::to_vec(&record)?;
        ctx.put(id, payload.clone());
        if transition.entered(QueryState::Done) {
            info!(id, inconsistent = record.is_inconsistent(), "all unmask contributions in");
            ctx.set_event(events::DONE_QUERY, payload);
        }
        Ok(record.contribution_count().to_string().into_bytes())
    }

    fn close(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let mut record = Self::read(ctx, id)?;
        let identity = ctx.identity().to_string();
        let transition = record.close(&identity)?;
        let payload = serde_json::to_vec(&record)?;
        if transition.changed() {
            ctx.put(id, payload.clone());
        }
        Ok(payload)
    }

    fn retrieve(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let mut record = Self::read(ctx, id)?;
        let transition = record.retrieve()?;
        let payload = serde_json::to_vec(&record)?;
        if transition.changed() {
            ctx.put(id, payload.clone());
        }
        Ok(payload)
    }

    fn remove(ctx: &mut TxContext<'_>, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let id = arg(args, 0, "id")?;
        let record = Self::read(ctx, id)?;
        record.authorize_remove(ctx.identity())?;
        ctx.delete(id);
        ctx.set_event(events::REMOVE_QUERY, serde_json::to_vec(&record)?);
        info!(id, "query removed");
        Ok(Vec::new())
    }
}

impl Contract for QueryContract {
    fn name(&self) -> &'static str {
        QUERY
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
                Ok(flag(ctx.exists(id)?))
            }
            other => Err(LedgerError::UnknownTransaction {
                contract: QUERY.into(),
                tx: other.into(),
            }),
        }
    }
}
