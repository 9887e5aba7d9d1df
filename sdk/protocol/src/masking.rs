//! Participant-side masking.
//!
//! A participant with secret `s` draws one mask `m_i` per operator, H-encrypts
//! `s + Σ m_i` for the asker and Q-encrypts each `m_i` for operator `i`.

use num_bigint::{BigUint, RandBigInt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tally_crypto::{LatticeCiphertext, LatticePublicKey, PaillierCiphertext, PaillierPublicKey};

use crate::error::ProtocolError;

pub const DEFAULT_SECRET_BITS: u64 = 64;
pub const DEFAULT_MASK_BITS: u64 = 128;
pub const DEFAULT_MAX_PARTICIPANTS: u64 = 1 << 20;

/// Widest mask whose column sums still fit a lattice message as decimal text
pub const MAX_MASK_BITS: u64 = 256;

/// Magnitudes of secrets and masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingParams {
    pub secret_bits: u64,
    pub mask_bits: u64,
    pub max_participants: u64,
}

impl Default for MaskingParams {
    fn default() -> Self {
        Self {
            secret_bits: DEFAULT_SECRET_BITS,
            mask_bits: DEFAULT_MASK_BITS,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

fn bit_len(value: u64) -> u64 {
    u64::from(u64::BITS - value.leading_zeros())
}

impl MaskingParams {
    /// Upper bound on the bit length of an aggregate over `max_participants`.
    ///
    /// One total is below `2^secret + N * 2^mask <= (N + 1) * 2^max(secret, mask)`.
    pub fn aggregate_bits(&self, committee_size: usize) -> u64 {
        let widest = self.secret_bits.max(self.mask_bits);
        widest + bit_len(committee_size as u64 + 1) + bit_len(self.max_participants)
    }

    /// Reject parameters whose aggregate could wrap the homomorphic modulus
    pub fn check_capacity(&self, modulus_bits: u64, committee_size: usize) -> Result<(), ProtocolError> {
        if self.secret_bits == 0 || self.mask_bits == 0 || self.max_participants == 0 {
            return Err(ProtocolError::InvalidSettings(
                "secret_bits, mask_bits and max_participants must be positive".into(),
            ));
        }
        if committee_size == 0 {
            return Err(ProtocolError::InvalidSettings("empty committee".into()));
        }
        if self.mask_bits > MAX_MASK_BITS {
            return Err(ProtocolError::Capacity(format!(
                "mask_bits {} exceeds {MAX_MASK_BITS}",
                self.mask_bits
            )));
        }

        let needed = self.aggregate_bits(committee_size);
        // strictly below the modulus, one bit of headroom
        if needed >= modulus_bits {
            return Err(ProtocolError::Capacity(format!(
                "aggregate needs {needed} bits, modulus has {modulus_bits}"
            )));
        }
        Ok(())
    }

    /// Capacity only holds for aggregations of at most `max_participants`
    pub fn check_participants(&self, expected: usize) -> Result<(), ProtocolError> {
        if expected == 0 || expected as u64 > self.max_participants {
            return Err(ProtocolError::Capacity(format!(
                "expected participants {expected} outside 1..={}",
                self.max_participants
            )));
        }
        Ok(())
    }

    fn check_secret(&self, secret: &BigUint) -> Result<(), ProtocolError> {
        if secret.bits() > self.secret_bits {
            return Err(ProtocolError::SecretOutOfRange {
                bits: self.secret_bits,
            });
        }
        Ok(())
    }
}

/// What one participant writes to an aggregation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedContribution {
    pub blinded_sum: PaillierCiphertext,
    /// One entry per operator, in committee order
    pub masks: Vec<LatticeCiphertext>,
}

/// Produces masked contributions for one aggregation
pub struct MaskingGenerator<'a> {
    asker: &'a PaillierPublicKey,
    operators: &'a [LatticePublicKey],
    params: MaskingParams,
}

impl<'a> MaskingGenerator<'a> {
    pub fn new(
        asker: &'a PaillierPublicKey,
        operators: &'a [LatticePublicKey],
        params: MaskingParams,
    ) -> Result<Self, ProtocolError> {
        params.check_capacity(asker.modulus_bits(), operators.len())?;
        Ok(Self {
            asker,
            operators,
            params,
        })
    }

    pub fn params(&self) -> &MaskingParams {
        &self.params
    }

    /// Mask `secret` with fresh random masks
    pub fn generate(&self, secret: &BigUint) -> Result<MaskedContribution, ProtocolError> {
        self.generate_with_rng(secret, &mut rand::thread_rng())
    }

    pub fn generate_with_rng<R: Rng + ?Sized>(
        &self,
        secret: &BigUint,
        rng: &mut R,
    ) -> Result<MaskedContribution, ProtocolError> {
        self.params.check_secret(secret)?;
        let masks: Vec<BigUint> = self
            .operators
            .iter()
            .map(|_| rng.gen_biguint(self.params.mask_bits))
            .collect();
        self.mask_with(secret, &masks, rng)
    }

    /// Draw a random secret from the allowed domain and mask it
    pub fn generate_random(&self) -> Result<(BigUint, MaskedContribution), ProtocolError> {
        let mut rng = rand::thread_rng();
        let secret = rng.gen_biguint(self.params.secret_bits);
        let contribution = self.generate_with_rng(&secret, &mut rng)?;
        Ok((secret, contribution))
    }

    /// Mask `secret` with caller-chosen masks
    pub fn mask_with<R: Rng + ?Sized>(
        &self,
        secret: &BigUint,
        masks: &[BigUint],
        rng: &mut R,
    ) -> Result<MaskedContribution, ProtocolError> {
        self.params.check_secret(secret)?;
        if masks.len() != self.operators.len() {
            return Err(ProtocolError::MaskRowWidth {
                expected: self.operators.len(),
                got: masks.len(),
            });
        }

        let total = masks.iter().fold(secret.clone(), |acc, m| acc + m);
        if &total >= self.asker.modulus() {
            return Err(ProtocolError::Capacity(
                "blinded total does not fit below the homomorphic modulus".into(),
            ));
        }

        let blinded_sum = self.asker.encrypt_scaled(&total, 0, rng)?;
        let masks = self
            .operators
            .iter()
            .zip(masks)
            .map(|(key, mask)| key.encrypt_integer(mask))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MaskedContribution { blinded_sum, masks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;
    use tally_crypto::{LatticeKeyPair, LatticeParams, generate_keypair};

    fn sum_masks<'m>(masks: impl IntoIterator<Item = &'m BigUint>) -> BigUint {
        masks.into_iter().fold(BigUint::zero(), |acc, m| acc + m)
    }

    fn setup(n: usize) -> (tally_crypto::PaillierPrivateKey, Vec<LatticeKeyPair>) {
        let (_, sk) = generate_keypair(512).unwrap();
        let ops = (0..n)
            .map(|_| LatticeKeyPair::generate(LatticeParams::MlKem768))
            .collect();
        (sk, ops)
    }

    fn publics(ops: &[LatticeKeyPair]) -> Vec<LatticePublicKey> {
        ops.iter().map(|kp| kp.public_key().clone()).collect()
    }

    #[test]
    fn test_blinded_total_matches_masks() {
        let (sk, ops) = setup(3);
        let keys = publics(&ops);
        let generator = MaskingGenerator::new(sk.public_key(), &keys, MaskingParams::default()).unwrap();

        let secret = BigUint::from(1234u32);
        let contribution = generator.generate(&secret).unwrap();
        assert_eq!(contribution.masks.len(), 3);

        let masks: Vec<BigUint> = ops
            .iter()
            .zip(&contribution.masks)
            .map(|(kp, ct)| kp.decrypt_integer(ct).unwrap())
            .collect();
        let total = sk.decrypt(&contribution.blinded_sum).unwrap();
        assert_eq!(total, secret + sum_masks(&masks));
    }

    #[test]
    fn test_column_only_opens_for_its_operator() {
        let (sk, ops) = setup(2);
        let keys = publics(&ops);
        let generator = MaskingGenerator::new(sk.public_key(), &keys, MaskingParams::default()).unwrap();
        let mut rng = rand::thread_rng();

        let masks = [BigUint::from(111u32), BigUint::from(222u32)];
        let contribution = generator
            .mask_with(&BigUint::from(5u32), &masks, &mut rng)
            .unwrap();

        assert_eq!(ops[0].decrypt_integer(&contribution.masks[0]).unwrap(), masks[0]);
        let cross = ops[1].decrypt_integer(&contribution.masks[0]);
        assert!(cross.map(|v| v != masks[0]).unwrap_or(true));
    }

    #[test]
    fn test_reused_masks_leak_secret_difference() {
        let (sk, ops) = setup(2);
        let keys = publics(&ops);
        let generator = MaskingGenerator::new(sk.public_key(), &keys, MaskingParams::default()).unwrap();
        let mut rng = rand::thread_rng();

        let shared = [rng.gen_biguint(128), rng.gen_biguint(128)];
        let a = generator.mask_with(&BigUint::from(900u32), &shared, &mut rng).unwrap();
        let b = generator.mask_with(&BigUint::from(400u32), &shared, &mut rng).unwrap();
        let ta = sk.decrypt(&a.blinded_sum).unwrap();
        let tb = sk.decrypt(&b.blinded_sum).unwrap();
        // Same masks cancel: anyone seeing both totals learns s_a - s_b
        assert_eq!(ta - tb, BigUint::from(500u32));

        let c = generator.generate(&BigUint::from(900u32)).unwrap();
        let d = generator.generate(&BigUint::from(400u32)).unwrap();
        let tc = sk.decrypt(&c.blinded_sum).unwrap();
        let td = sk.decrypt(&d.blinded_sum).unwrap();
        assert!(tc < td || tc - td != BigUint::from(500u32));
    }

    #[test]
    fn test_secret_domain_enforced() {
        let (sk, ops) = setup(1);
        let keys = publics(&ops);
        let params = MaskingParams {
            secret_bits: 8,
            ..MaskingParams::default()
        };
        let generator = MaskingGenerator::new(sk.public_key(), &keys, params).unwrap();

        assert!(generator.generate(&BigUint::from(255u32)).is_ok());
        assert_eq!(
            generator.generate(&BigUint::from(256u32)).unwrap_err(),
            ProtocolError::SecretOutOfRange { bits: 8 }
        );

        let (secret, _) = generator.generate_random().unwrap();
        assert!(secret.bits() <= 8);
    }

    #[test]
    fn test_capacity_check() {
        let params = MaskingParams::default();
        // 128 + bits(4) + bits(2^20) = 128 + 3 + 21
        assert_eq!(params.aggregate_bits(3), 152);
        assert!(params.check_capacity(512, 3).is_ok());
        assert!(matches!(
            params.check_capacity(152, 3),
            Err(ProtocolError::Capacity(_))
        ));

        let wide = MaskingParams {
            mask_bits: MAX_MASK_BITS + 1,
            ..params
        };
        assert!(matches!(wide.check_capacity(4096, 3), Err(ProtocolError::Capacity(_))));
        assert!(matches!(
            params.check_capacity(512, 0),
            Err(ProtocolError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_participants_bounded() {
        let params = MaskingParams {
            max_participants: 8,
            ..MaskingParams::default()
        };
        assert!(params.check_participants(1).is_ok());
        assert!(params.check_participants(8).is_ok());
        assert!(matches!(params.check_participants(9), Err(ProtocolError::Capacity(_))));
        assert!(matches!(params.check_participants(0), Err(ProtocolError::Capacity(_))));
    }

    #[test]
    fn test_wrong_mask_count_rejected() {
        let (sk, ops) = setup(2);
        let keys = publics(&ops);
        let generator = MaskingGenerator::new(sk.public_key(), &keys, MaskingParams::default()).unwrap();

        let err = generator
            .mask_with(&BigUint::from(1u32), &[BigUint::from(1u32)], &mut rand::thread_rng())
            .unwrap_err();
        assert_eq!(err, ProtocolError::MaskRowWidth { expected: 2, got: 1 });
    }
}
