//! Aggregation record state machine
//!
//! ```text
//!   register × N            add × expected
//! ┌───────────┐  Nth    ┌─────────────┐  last   ┌────────┐
//! │ SELECTING │────────▶│ AGGREGATING │────────▶│ CLOSED │
//! └───────────┘         └─────────────┘         └────────┘
//!       │                      │ close               ▲
//!       └──────── close ───────┴─────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tally_crypto::{CryptoError, LatticePublicKey, PaillierCiphertext};

use crate::error::ProtocolError;
use crate::masking::MaskedContribution;
use crate::matrix::MaskMatrix;
use crate::registry::AskerPublicKeys;
use crate::state::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationState {
    Selecting,
    Aggregating,
    Closed,
}

impl AggregationState {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationState::Selecting => "SELECTING",
            AggregationState::Aggregating => "AGGREGATING",
            AggregationState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AggregationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registered committee member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSlot {
    pub identity: String,
    pub key: LatticePublicKey,
}

/// Masking only produces exponent-0 sums; anything else is forged
pub(crate) fn check_integer_encoding(sum: &PaillierCiphertext) -> Result<(), ProtocolError> {
    if sum.exponent() != 0 {
        return Err(CryptoError::InvalidExponent {
            from: sum.exponent(),
            to: 0,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRecord {
    id: String,
    committee_size: usize,
    expected_participants: usize,
    asker: AskerPublicKeys,
    operators: Vec<OperatorSlot>,
    blinded_sum: Option<PaillierCiphertext>,
    masks: MaskMatrix,
    state: AggregationState,
}

impl AggregationRecord {
    pub fn new(
        id: impl Into<String>,
        committee_size: usize,
        expected_participants: usize,
        asker: AskerPublicKeys,
    ) -> Result<Self, ProtocolError> {
        if committee_size == 0 {
            return Err(ProtocolError::InvalidSettings("committee size must be positive".into()));
        }
        if expected_participants == 0 {
            return Err(ProtocolError::InvalidSettings(
                "expected participants must be positive".into(),
            ));
        }

        Ok(Self {
            id: id.into(),
            committee_size,
            expected_participants,
            asker,
            operators: Vec::with_capacity(committee_size),
            blinded_sum: None,
            masks: MaskMatrix::new(committee_size),
            state: AggregationState::Selecting,
        })
    }

    fn violation(&self, operation: &'static str) -> ProtocolError {
        ProtocolError::InvalidState {
            record: "aggregation",
            operation,
            state: self.state.name(),
        }
    }

    /// Take the next free committee slot; the Nth registration starts aggregating
    pub fn register(
        &mut self,
        identity: impl Into<String>,
        key: LatticePublicKey,
    ) -> Result<(usize, Transition<AggregationState>), ProtocolError> {
        let identity = identity.into();
        if self.state != AggregationState::Selecting {
            if self.state == AggregationState::Aggregating {
                return Err(ProtocolError::CommitteeFull {
                    committee_size: self.committee_size,
                });
            }
            return Err(self.violation("register"));
        }
        if self.operators.iter().any(|slot| slot.identity == identity) {
            return Err(ProtocolError::DuplicateOperator(identity));
        }

        let index = self.operators.len();
        self.operators.push(OperatorSlot { identity, key });

        let from = self.state;
        if self.operators.len() == self.committee_size {
            self.state = AggregationState::Aggregating;
        }
        Ok((index, Transition::new(from, self.state)))
    }

    /// Fold one participant's contribution; the last expected one closes the record
    pub fn add(
        &mut self,
        contribution: MaskedContribution,
    ) -> Result<Transition<AggregationState>, ProtocolError> {
        if self.state != AggregationState::Aggregating {
            return Err(self.violation("add"));
        }
        self.masks.check_row(&contribution.masks)?;
        check_integer_encoding(&contribution.blinded_sum)?;

        let accumulated = match &self.blinded_sum {
            Some(current) => self.asker.homomorphic.add(current, &contribution.blinded_sum)?,
            None => {
                if contribution.blinded_sum.modulus() != self.asker.homomorphic.modulus() {
                    return Err(CryptoError::ModulusMismatch.into());
                }
                contribution.blinded_sum
            }
        };

        self.masks.push_row(contribution.masks)?;
        self.blinded_sum = Some(accumulated);

        let from = self.state;
        if self.masks.len() == self.expected_participants {
            self.state = AggregationState::Closed;
        }
        Ok(Transition::new(from, self.state))
    }

    /// Abort selection or stop aggregating; no-op once closed
    pub fn close(&mut self) -> Transition<AggregationState> {
        let from = self.state;
        self.state = AggregationState::Closed;
        Transition::new(from, self.state)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AggregationState {
        self.state
    }

    pub fn committee_size(&self) -> usize {
        self.committee_size
    }

    pub fn expected_participants(&self) -> usize {
        self.expected_participants
    }

    pub fn participants(&self) -> usize {
        self.masks.len()
    }

    /// Reached the expected participant count rather than being closed early
    pub fn is_complete(&self) -> bool {
        self.participants() == self.expected_participants
    }

    pub fn asker(&self) -> &AskerPublicKeys {
        &self.asker
    }

    pub fn operators(&self) -> &[OperatorSlot] {
        &self.operators
    }

    pub fn operator_keys(&self) -> Vec<LatticePublicKey> {
        self.operators.iter().map(|slot| slot.key.clone()).collect()
    }

    pub fn operator_index(&self, identity: &str) -> Option<usize> {
        self.operators.iter().position(|slot| slot.identity == identity)
    }

    pub fn blinded_sum(&self) -> Option<&PaillierCiphertext> {
        self.blinded_sum.as_ref()
    }

    pub fn masks(&self) -> &MaskMatrix {
        &self.masks
    }

    /// Reassemble a record from its stored parts
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: String,
        committee_size: usize,
        expected_participants: usize,
        asker: AskerPublicKeys,
        operators: Vec<OperatorSlot>,
        blinded_sum: Option<PaillierCiphertext>,
        masks: MaskMatrix,
        state: AggregationState,
    ) -> Result<Self, ProtocolError> {
        if operators.len() > committee_size || masks.width() != committee_size {
            return Err(ProtocolError::InvalidSettings(format!(
                "aggregation {id} does not match its committee size"
            )));
        }
        Ok(Self {
            id,
            committee_size,
            expected_participants,
            asker,
            operators,
            blinded_sum,
            masks,
            state,
        })
    }
}
