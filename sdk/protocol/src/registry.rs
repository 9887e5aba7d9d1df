//! Asker key material.
//!
//! The asker holds one homomorphic keypair (blinded sums) and one lattice keypair
//! (condensed masks re-encrypted by operators). Only [`AskerPublicKeys`] is shared.

use serde::{Deserialize, Serialize};
use tally_crypto::{
    CryptoError, LatticeKeyPair, LatticeParams, LatticePublicKey, PaillierPrivateKey,
    PaillierPublicKey, PublicKey, generate_keypair,
};

#[derive(Debug, Clone)]
pub struct AskerKeys {
    homomorphic: PaillierPrivateKey,
    lattice: LatticeKeyPair,
}

impl AskerKeys {
    pub fn generate(homomorphic_bits: u64, lattice: LatticeParams) -> Result<Self, CryptoError> {
        let (_, homomorphic) = generate_keypair(homomorphic_bits)?;
        Ok(Self {
            homomorphic,
            lattice: LatticeKeyPair::generate(lattice),
        })
    }

    pub fn from_parts(homomorphic: PaillierPrivateKey, lattice: LatticeKeyPair) -> Self {
        Self {
            homomorphic,
            lattice,
        }
    }

    pub fn homomorphic(&self) -> &PaillierPrivateKey {
        &self.homomorphic
    }

    pub fn lattice(&self) -> &LatticeKeyPair {
        &self.lattice
    }

    pub fn public(&self) -> AskerPublicKeys {
        AskerPublicKeys {
            homomorphic: self.homomorphic.public_key().clone(),
            lattice: self.lattice.public_key().clone(),
        }
    }
}

/// Public halves of the asker's keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskerPublicKeys {
    pub homomorphic: PaillierPublicKey,
    pub lattice: LatticePublicKey,
}

impl AskerPublicKeys {
    /// Rebuild from scheme-tagged keys, checking each key's scheme
    pub fn from_tagged(homomorphic: &PublicKey, lattice: &PublicKey) -> Result<Self, CryptoError> {
        Ok(Self {
            homomorphic: homomorphic.as_homomorphic()?.clone(),
            lattice: lattice.as_lattice()?.clone(),
        })
    }

    pub fn tagged(&self) -> (PublicKey, PublicKey) {
        (
            PublicKey::AdditiveHomomorphic(self.homomorphic.clone()),
            PublicKey::PostQuantumLattice(self.lattice.clone()),
        )
    }
}
