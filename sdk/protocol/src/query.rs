//! Query record state machine
//!
//! ```text
//! ┌─────────┐  Nth unmask  ┌──────┐  retrieve  ┌────────┐
//! │ WAITING │─────────────▶│ DONE │───────────▶│ CLOSED │
//! └─────────┘              └──────┘            └────────┘
//!      │                       │ close/remove       ▲
//!      └────── close/remove ───┴────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tally_crypto::PaillierCiphertext;

use crate::aggregation::check_integer_encoding;
use crate::condensation::UnmaskContribution;
use crate::error::ProtocolError;
use crate::registry::AskerPublicKeys;
use crate::state::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Waiting,
    Done,
    Closed,
}

impl QueryState {
    pub fn name(&self) -> &'static str {
        match self {
            QueryState::Waiting => "WAITING",
            QueryState::Done => "DONE",
            QueryState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySettings {
    pub committee_size: usize,
    pub expected_participants: usize,
    pub duration_secs: u64,
    /// Unmask aggregations closed before reaching `expected_participants`
    #[serde(default)]
    pub allow_partial: bool,
}

impl QuerySettings {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.committee_size == 0 {
            return Err(ProtocolError::InvalidSettings("committee size must be positive".into()));
        }
        if self.expected_participants == 0 {
            return Err(ProtocolError::InvalidSettings(
                "expected participants must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Blinded aggregate as reported by an operator alongside its contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub blinded_sum: PaillierCiphertext,
    pub participants: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    id: String,
    settings: QuerySettings,
    creator: String,
    created_at: u64,
    asker: AskerPublicKeys,
    contributions: Vec<Option<UnmaskContribution>>,
    result: Option<AggregateResult>,
    inconsistent: bool,
    state: QueryState,
}

impl QueryRecord {
    pub fn new(
        id: impl Into<String>,
        settings: QuerySettings,
        creator: impl Into<String>,
        created_at: u64,
        asker: AskerPublicKeys,
    ) -> Result<Self, ProtocolError> {
        settings.validate()?;
        Ok(Self {
            id: id.into(),
            settings,
            creator: creator.into(),
            created_at,
            asker,
            contributions: vec![None; settings.committee_size],
            result: None,
            inconsistent: false,
            state: QueryState::Waiting,
        })
    }

    fn violation(&self, operation: &'static str) -> ProtocolError {
        ProtocolError::InvalidState {
            record: "query",
            operation,
            state: self.state.name(),
        }
    }

    fn authorize(&self, identity: &str, operation: &'static str) -> Result<(), ProtocolError> {
        if identity != self.creator {
            return Err(ProtocolError::Unauthorized {
                identity: identity.into(),
                operation,
                creator: self.creator.clone(),
            });
        }
        Ok(())
    }

    /// Post operator `contribution.index`'s share; the Nth share makes the query DONE.
    ///
    /// Operators that report a different aggregate than the first one mark the query
    /// inconsistent.
    pub fn register_unmask(
        &mut self,
        contribution: UnmaskContribution,
        result: AggregateResult,
    ) -> Result<Transition<QueryState>, ProtocolError> {
        if self.state != QueryState::Waiting {
            return Err(self.violation("register unmask"));
        }

        let index = contribution.index;
        let committee_size = self.settings.committee_size;
        let slot = self
            .contributions
            .get(index)
            .ok_or(ProtocolError::IndexOutOfRange {
                index,
                committee_size,
            })?;
        if slot.is_some() {
            return Err(ProtocolError::DuplicateContribution(index));
        }
        if result.participants != self.settings.expected_participants && !self.settings.allow_partial {
            return Err(ProtocolError::PartialAggregate {
                participants: result.participants,
                expected: self.settings.expected_participants,
            });
        }
        check_integer_encoding(&result.blinded_sum)?;
        if result.blinded_sum.modulus() != self.asker.homomorphic.modulus() {
            return Err(tally_crypto::CryptoError::ModulusMismatch.into());
        }

        if self.result.as_ref().is_some_and(|first| *first != result) {
            log::warn!("query {}: operator {index} reported a different aggregate", self.id);
            self.inconsistent = true;
        }
        if self.result.is_none() {
            self.result = Some(result);
        }
        self.contributions[index] = Some(contribution);

        let from = self.state;
        if self.contribution_count() == committee_size {
            self.state = QueryState::Done;
        }
        Ok(Transition::new(from, self.state))
    }

    /// Read the finished record; the first read after DONE closes it
    pub fn retrieve(&mut self) -> Result<Transition<QueryState>, ProtocolError> {
        match self.state {
            QueryState::Waiting => Err(ProtocolError::NotReady(self.id.clone())),
            QueryState::Done => {
                self.state = QueryState::Closed;
                Ok(Transition::new(QueryState::Done, QueryState::Closed))
            }
            QueryState::Closed => Ok(Transition::stay(QueryState::Closed)),
        }
    }

    /// Creator-only; idempotent
    pub fn close(&mut self, identity: &str) -> Result<Transition<QueryState>, ProtocolError> {
        self.authorize(identity, "close")?;
        let from = self.state;
        self.state = QueryState::Closed;
        Ok(Transition::new(from, self.state))
    }

    /// Creator-only; the caller deletes the record
    pub fn authorize_remove(&self, identity: &str) -> Result<(), ProtocolError> {
        self.authorize(identity, "remove")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Unix seconds after which the asker stops waiting
    pub fn deadline(&self) -> u64 {
        self.created_at.saturating_add(self.settings.duration_secs)
    }

    pub fn asker(&self) -> &AskerPublicKeys {
        &self.asker
    }

    pub fn contribution_count(&self) -> usize {
        self.contributions.iter().filter(|c| c.is_some()).count()
    }

    pub fn contributions(&self) -> Vec<UnmaskContribution> {
        self.contributions.iter().flatten().cloned().collect()
    }

    pub fn result(&self) -> Option<&AggregateResult> {
        self.result.as_ref()
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }
}
