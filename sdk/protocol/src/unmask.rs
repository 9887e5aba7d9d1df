use num_bigint::{BigInt, BigUint};
use num_traits::Signed;
use tally_crypto::PaillierCiphertext;

use crate::condensation::UnmaskContribution;
use crate::error::ProtocolError;
use crate::registry::AskerKeys;

/// Recover Σ secrets = Dec_H(blinded sum) − Σ Dec_Q(contributions)
pub fn unmask(
    keys: &AskerKeys,
    blinded_sum: &PaillierCiphertext,
    contributions: &[UnmaskContribution],
) -> Result<BigUint, ProtocolError> {
    let total = BigInt::from(keys.homomorphic().decrypt(blinded_sum)?);

    let mut masks = BigInt::default();
    for contribution in contributions {
        masks += BigInt::from(keys.lattice().decrypt_integer(&contribution.ciphertext)?);
    }

    let aggregate = total - masks;
    if aggregate.is_negative() {
        return Err(ProtocolError::InconsistentResult(
            "condensed masks exceed the blinded total".into(),
        ));
    }
    aggregate
        .to_biguint()
        .ok_or_else(|| ProtocolError::InconsistentResult("negative aggregate".into()))
}
