//! Tally Crypto
//!
//! The two asymmetric schemes used by masked sum aggregation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Key Schemes                               │
//! │                                                                  │
//! │  H: additive homomorphic (Paillier)    Q: lattice (ML-KEM + DEM) │
//! │  ┌────────────────────────────┐        ┌──────────────────────┐  │
//! │  │ Enc(a) ⊕ Enc(b) = Enc(a+b) │        │ per-operator masks   │  │
//! │  │ held by the asker          │        │ one keypair/operator │  │
//! │  └────────────────────────────┘        └──────────────────────┘  │
//! │                                                                  │
//! │  Only public halves are ever written to the ledger.              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod encoding;
pub mod error;
pub mod homomorphic;
pub mod keys;
pub mod lattice;
pub mod primes;

pub use error::CryptoError;
pub use homomorphic::{PaillierCiphertext, PaillierPrivateKey, PaillierPublicKey, generate_keypair};
pub use keys::{Ciphertext, KeyPair, PublicKey, Scheme};
pub use lattice::{
    LatticeCiphertext, LatticeKeyPair, LatticeParams, LatticePublicKey, MAX_MESSAGE_LEN,
};
