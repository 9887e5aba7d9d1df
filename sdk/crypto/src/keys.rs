//! Scheme-tagged keys and ciphertexts.
//!
//! The homomorphic and lattice schemes share nothing internally; these unions let
//! callers hold either one behind a single type and fail loudly when they are mixed.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::homomorphic::{PaillierCiphertext, PaillierPrivateKey, PaillierPublicKey};
use crate::lattice::{LatticeCiphertext, LatticeKeyPair, LatticePublicKey};

/// Which scheme a key or ciphertext belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    AdditiveHomomorphic,
    PostQuantumLattice,
}

impl Scheme {
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::AdditiveHomomorphic => "additive-homomorphic",
            Scheme::PostQuantumLattice => "post-quantum-lattice",
        }
    }
}

fn mismatch(expected: Scheme, got: Scheme) -> CryptoError {
    CryptoError::SchemeMismatch {
        expected: expected.name(),
        got: got.name(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "key")]
pub enum PublicKey {
    AdditiveHomomorphic(PaillierPublicKey),
    PostQuantumLattice(LatticePublicKey),
}

impl PublicKey {
    pub fn scheme(&self) -> Scheme {
        match self {
            PublicKey::AdditiveHomomorphic(_) => Scheme::AdditiveHomomorphic,
            PublicKey::PostQuantumLattice(_) => Scheme::PostQuantumLattice,
        }
    }

    /// Encrypt a non-negative integer under either scheme.
    ///
    /// Lattice encryption carries the integer as its decimal text.
    pub fn encrypt_integer(&self, value: &BigUint) -> Result<Ciphertext, CryptoError> {
        match self {
            PublicKey::AdditiveHomomorphic(pk) => {
                pk.encrypt(value).map(Ciphertext::AdditiveHomomorphic)
            }
            PublicKey::PostQuantumLattice(pk) => {
                pk.encrypt_integer(value).map(Ciphertext::PostQuantumLattice)
            }
        }
    }

    pub fn as_homomorphic(&self) -> Result<&PaillierPublicKey, CryptoError> {
        match self {
            PublicKey::AdditiveHomomorphic(pk) => Ok(pk),
            other => Err(mismatch(Scheme::AdditiveHomomorphic, other.scheme())),
        }
    }

    pub fn as_lattice(&self) -> Result<&LatticePublicKey, CryptoError> {
        match self {
            PublicKey::PostQuantumLattice(pk) => Ok(pk),
            other => Err(mismatch(Scheme::PostQuantumLattice, other.scheme())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum KeyPair {
    AdditiveHomomorphic(PaillierPrivateKey),
    PostQuantumLattice(LatticeKeyPair),
}

impl KeyPair {
    pub fn scheme(&self) -> Scheme {
        match self {
            KeyPair::AdditiveHomomorphic(_) => Scheme::AdditiveHomomorphic,
            KeyPair::PostQuantumLattice(_) => Scheme::PostQuantumLattice,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::AdditiveHomomorphic(sk) => PublicKey::AdditiveHomomorphic(sk.public_key().clone()),
            KeyPair::PostQuantumLattice(kp) => PublicKey::PostQuantumLattice(kp.public_key().clone()),
        }
    }

    /// Decrypt an integer produced by [`PublicKey::encrypt_integer`]
    pub fn decrypt_integer(&self, ciphertext: &Ciphertext) -> Result<BigUint, CryptoError> {
        match (self, ciphertext) {
            (KeyPair::AdditiveHomomorphic(sk), Ciphertext::AdditiveHomomorphic(c)) => sk.decrypt(c),
            (KeyPair::PostQuantumLattice(kp), Ciphertext::PostQuantumLattice(c)) => {
                kp.decrypt_integer(c)
            }
            (key, ct) => Err(mismatch(key.scheme(), ct.scheme())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "ciphertext")]
pub enum Ciphertext {
    AdditiveHomomorphic(PaillierCiphertext),
    PostQuantumLattice(LatticeCiphertext),
}

impl Ciphertext {
    pub fn scheme(&self) -> Scheme {
        match self {
            Ciphertext::AdditiveHomomorphic(_) => Scheme::AdditiveHomomorphic,
            Ciphertext::PostQuantumLattice(_) => Scheme::PostQuantumLattice,
        }
    }

    /// Homomorphic addition; only defined for the additive scheme
    pub fn add(&self, other: &Ciphertext) -> Result<Ciphertext, CryptoError> {
        match (self, other) {
            (Ciphertext::AdditiveHomomorphic(a), Ciphertext::AdditiveHomomorphic(b)) => {
                a.add(b).map(Ciphertext::AdditiveHomomorphic)
            }
            (a, b) if a.scheme() != b.scheme() => Err(mismatch(a.scheme(), b.scheme())),
            (a, _) => Err(mismatch(Scheme::AdditiveHomomorphic, a.scheme())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homomorphic::generate_keypair;
    use crate::lattice::LatticeParams;

    fn both() -> (KeyPair, KeyPair) {
        let (_, sk) = generate_keypair(512).unwrap();
        (
            KeyPair::AdditiveHomomorphic(sk),
            KeyPair::PostQuantumLattice(LatticeKeyPair::generate(LatticeParams::MlKem768)),
        )
    }

    #[test]
    fn test_integer_roundtrip_under_each_scheme() {
        let (h, q) = both();
        let value = BigUint::from(123_456_789_012_345u64);
        for key in [&h, &q] {
            let ct = key.public_key().encrypt_integer(&value).unwrap();
            assert_eq!(ct.scheme(), key.scheme());
            assert_eq!(key.decrypt_integer(&ct).unwrap(), value);
        }
    }

    #[test]
    fn test_mixing_schemes_is_rejected() {
        let (h, q) = both();
        let h_ct = h.public_key().encrypt_integer(&BigUint::from(1u32)).unwrap();
        let q_ct = q.public_key().encrypt_integer(&BigUint::from(1u32)).unwrap();

        assert!(matches!(
            q.decrypt_integer(&h_ct),
            Err(CryptoError::SchemeMismatch { .. })
        ));
        assert!(matches!(h_ct.add(&q_ct), Err(CryptoError::SchemeMismatch { .. })));
        assert!(matches!(q_ct.add(&q_ct), Err(CryptoError::SchemeMismatch { .. })));
        assert!(h.public_key().as_lattice().is_err());
        assert!(q.public_key().as_homomorphic().is_err());
    }

    #[test]
    fn test_tagged_json_form() {
        let (h, q) = both();
        for key in [h.public_key(), q.public_key()] {
            let json = serde_json::to_string(&key).unwrap();
            let back: PublicKey = serde_json::from_str(&json).unwrap();
            assert_eq!(back, key);
        }
    }
}
