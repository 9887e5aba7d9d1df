//! Operator-side condensation.
//!
//! Operator `i` opens column `i` of the mask matrix, sums the masks and re-encrypts
//! the sum for the asker. The asker never sees an individual mask.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tally_crypto::{LatticeCiphertext, LatticeKeyPair, LatticePublicKey};

use crate::error::ProtocolError;
use crate::matrix::MaskMatrix;

/// One operator's unmasking share, addressed to the asker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmaskContribution {
    pub index: usize,
    pub ciphertext: LatticeCiphertext,
}

pub fn condense(
    keypair: &LatticeKeyPair,
    index: usize,
    matrix: &MaskMatrix,
    asker: &LatticePublicKey,
) -> Result<UnmaskContribution, ProtocolError> {
    let mut sum = BigUint::default();
    for entry in matrix.column(index)? {
        sum += keypair.decrypt_integer(entry)?;
    }
    log::debug!(
        "operator {index} condensed {} masks ({} bits)",
        matrix.len(),
        sum.bits()
    );

    Ok(UnmaskContribution {
        index,
        ciphertext: asker.encrypt_integer(&sum)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_crypto::LatticeParams;

    fn keys(n: usize) -> Vec<LatticeKeyPair> {
        (0..n)
            .map(|_| LatticeKeyPair::generate(LatticeParams::MlKem768))
            .collect()
    }

    fn matrix_of(ops: &[LatticeKeyPair], rows: &[Vec<u64>]) -> MaskMatrix {
        let mut matrix = MaskMatrix::new(ops.len());
        for row in rows {
            let row = ops
                .iter()
                .zip(row)
                .map(|(kp, m)| kp.public_key().encrypt_integer(&BigUint::from(*m)).unwrap())
                .collect();
            matrix.push_row(row).unwrap();
        }
        matrix
    }

    #[test]
    fn test_condense_sums_own_column() {
        let ops = keys(3);
        let asker = LatticeKeyPair::generate(LatticeParams::MlKem768);
        let matrix = matrix_of(&ops, &[vec![1, 10, 100], vec![2, 20, 200]]);

        for (i, kp) in ops.iter().enumerate() {
            let share = condense(kp, i, &matrix, asker.public_key()).unwrap();
            assert_eq!(share.index, i);
            let expected = [3u32, 30, 300][i];
            assert_eq!(asker.decrypt_integer(&share.ciphertext).unwrap(), BigUint::from(expected));
        }
    }

    #[test]
    fn test_empty_matrix_condenses_to_zero() {
        let ops = keys(1);
        let asker = LatticeKeyPair::generate(LatticeParams::MlKem768);
        let matrix = MaskMatrix::new(1);

        let share = condense(&ops[0], 0, &matrix, asker.public_key()).unwrap();
        assert_eq!(asker.decrypt_integer(&share.ciphertext).unwrap(), BigUint::default());
    }

    #[test]
    fn test_wrong_column_never_opens() {
        let ops = keys(2);
        let asker = LatticeKeyPair::generate(LatticeParams::MlKem768);
        let matrix = matrix_of(&ops, &[vec![5, 6]]);

        // operator 0 holding column 1 either fails or decrypts garbage
        let opened = condense(&ops[0], 1, &matrix, asker.public_key())
            .and_then(|share| Ok(asker.decrypt_integer(&share.ciphertext)?));
        assert!(!matches!(opened, Ok(ref sum) if *sum == BigUint::from(6u32)));
        assert_eq!(
            condense(&ops[0], 2, &matrix, asker.public_key()).unwrap_err(),
            ProtocolError::IndexOutOfRange {
                index: 2,
                committee_size: 2
            }
        );
    }
}
