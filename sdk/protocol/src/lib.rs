//! Tally Protocol
//!
//! Masked sum aggregation between an asker, an operator committee and participants.
//!
//! ```text
//! participant ── MaskingGenerator ──▶ AggregationRecord (blinded sum, mask matrix)
//!                                           │ CLOSED
//!                                           ▼
//! operator i ─── condense(column i) ──▶ QueryRecord (unmask contributions)
//!                                           │ DONE
//!                                           ▼
//! asker ──────── unmask ──▶ Σ secrets
//! ```
//!
//! The records here are pure state machines. Atomicity under concurrent writers is
//! the ledger's job; every operation validates fully before it mutates.

pub mod aggregation;
pub mod condensation;
pub mod error;
pub mod masking;
pub mod matrix;
pub mod query;
pub mod registry;
pub mod state;
pub mod unmask;

pub use aggregation::{AggregationRecord, AggregationState, OperatorSlot};
pub use condensation::{UnmaskContribution, condense};
pub use error::ProtocolError;
pub use masking::{MaskedContribution, MaskingGenerator, MaskingParams};
pub use matrix::MaskMatrix;
pub use query::{AggregateResult, QueryRecord, QuerySettings, QueryState};
pub use registry::{AskerKeys, AskerPublicKeys};
pub use state::Transition;
pub use unmask::unmask;
