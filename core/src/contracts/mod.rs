//! Ledger contracts for aggregation and query records

pub mod aggregation;
pub mod query;

use std::str::FromStr;

use crate::ledger::{LedgerError, TxContext};

pub use aggregation::{AggregationContract, AggregationEntry};
pub use query::QueryContract;

pub const AGGREGATION: &str = "aggregation";
pub const QUERY: &str = "query";

/// Transaction names shared by both contracts
pub mod tx {
    pub const START: &str = "Start";
    pub const ADD: &str = "Add";
    pub const CLOSE: &str = "Close";
    pub const RETRIEVE: &str = "Retrieve";
    pub const REMOVE: &str = "Remove";
    pub const EXISTS: &str = "Exists";
}

/// Event names set on commit
pub mod events {
    pub const START_QUERY: &str = "StartQuery";
    pub const DONE_QUERY: &str = "DoneQuery";
    pub const REMOVE_QUERY: &str = "RemoveQuery";
    pub const START_AGGREGATING: &str = "StartAggregating";
    pub const AGGREGATION_CLOSED: &str = "AggregationClosed";
}

/// Transient map fields
pub mod transient {
    pub const PAILLIER: &str = "paillier";
    pub const POST_QUANTUM: &str = "post-quantum";
    pub const OPERATOR: &str = "operator";
    pub const CONTRIBUTION: &str = "contribution";
    pub const RESULT: &str = "result";
}

pub trait Contract: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(&self, ctx: &mut TxContext<'_>, tx: &str, args: &[String]) -> Result<Vec<u8>, LedgerError>;
}

pub(crate) fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, LedgerError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| LedgerError::BadArgument {
            name: name.into(),
            reason: "missing".into(),
        })
}

pub(crate) fn parse_arg<T>(args: &[String], index: usize, name: &str) -> Result<T, LedgerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    arg(args, index, name)?
        .parse()
        .map_err(|e: T::Err| LedgerError::BadArgument {
            name: name.into(),
            reason: e.to_string(),
        })
}

pub(crate) fn flag(value: bool) -> Vec<u8> {
    if value { b"true".to_vec() } else { b"false".to_vec() }
}
