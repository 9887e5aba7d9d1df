use serde::{Deserialize, Serialize};
use tally_crypto::LatticeCiphertext;

use crate::error::ProtocolError;

/// Append-only mask matrix: one row per participant, one column per operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskMatrix {
    width: usize,
    rows: Vec<Vec<LatticeCiphertext>>,
}

impl MaskMatrix {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: Vec::new(),
        }
    }

    /// Rebuild a matrix from stored rows, checking every row's width
    pub fn from_rows(width: usize, rows: Vec<Vec<LatticeCiphertext>>) -> Result<Self, ProtocolError> {
        let mut matrix = Self::new(width);
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn check_row(&self, row: &[LatticeCiphertext]) -> Result<(), ProtocolError> {
        if row.len() != self.width {
            return Err(ProtocolError::MaskRowWidth {
                expected: self.width,
                got: row.len(),
            });
        }
        Ok(())
    }

    pub fn push_row(&mut self, row: Vec<LatticeCiphertext>) -> Result<(), ProtocolError> {
        self.check_row(&row)?;
        self.rows.push(row);
        Ok(())
    }

    /// Entries of column `index`, one per participant
    pub fn column(&self, index: usize) -> Result<impl Iterator<Item = &LatticeCiphertext>, ProtocolError> {
        if index >= self.width {
            return Err(ProtocolError::IndexOutOfRange {
                index,
                committee_size: self.width,
            });
        }
        Ok(self.rows.iter().map(move |row| &row[index]))
    }

    pub fn rows(&self) -> &[Vec<LatticeCiphertext>] {
        &self.rows
    }
}
