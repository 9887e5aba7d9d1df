//! Additive Homomorphic Encryption (Paillier)
//!
//! Paillier with generator `g = n + 1`. Ciphertexts carry the public modulus they were
//! produced under and an explicit exponent: a ciphertext of `m` at exponent `e` encodes
//! the value `m * 16^e`. Integer encryptions use exponent 0.

use std::fmt;
use std::str::FromStr;

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::encoding::decimal;
use crate::error::CryptoError;
use crate::primes::{generate_prime, mod_inverse};

/// Base of the exponent encoding
pub const EXPONENT_BASE: u32 = 16;

/// Largest exponent magnitude, and largest alignment shift, a ciphertext may carry
pub const MAX_EXPONENT: u32 = 64;

/// Smallest modulus accepted by key generation
pub const MIN_MODULUS_BITS: u64 = 256;

/// Paillier public key (the modulus `n`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaillierPublicKey {
    #[serde(with = "decimal")]
    n: BigUint,
}

impl PaillierPublicKey {
    pub fn from_modulus(n: BigUint) -> Result<Self, CryptoError> {
        if n.bits() < 2 || n.is_even() {
            return Err(CryptoError::Malformed("paillier modulus".into()));
        }
        Ok(Self { n })
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    pub fn modulus_bits(&self) -> u64 {
        self.n.bits()
    }

    fn modulus_squared(&self) -> BigUint {
        &self.n * &self.n
    }

    /// Encrypt an integer at exponent 0
    pub fn encrypt(&self, plaintext: &BigUint) -> Result<PaillierCiphertext, CryptoError> {
        self.encrypt_scaled(plaintext, 0, &mut rand::thread_rng())
    }

    /// Encrypt `plaintext` as the value `plaintext * 16^exponent`
    pub fn encrypt_scaled<R: Rng + ?Sized>(
        &self,
        plaintext: &BigUint,
        exponent: i32,
        rng: &mut R,
    ) -> Result<PaillierCiphertext, CryptoError> {
        check_exponent(exponent)?;
        if plaintext >= &self.n {
            return Err(CryptoError::PlaintextOverflow {
                modulus_bits: self.modulus_bits(),
            });
        }

        let n_squared = self.modulus_squared();
        let r = loop {
            let r = rng.gen_biguint_range(&BigUint::one(), &self.n);
            if r.gcd(&self.n).is_one() {
                break r;
            }
        };

        // (1 + m·n) · r^n mod n²
        let g_m = (BigUint::one() + plaintext * &self.n) % &n_squared;
        let value = (g_m * r.modpow(&self.n, &n_squared)) % &n_squared;

        Ok(PaillierCiphertext {
            modulus: self.n.clone(),
            value,
            exponent,
        })
    }

    /// Homomorphic addition of two ciphertexts under this key
    pub fn add(
        &self,
        a: &PaillierCiphertext,
        b: &PaillierCiphertext,
    ) -> Result<PaillierCiphertext, CryptoError> {
        if a.modulus != self.n {
            return Err(CryptoError::ModulusMismatch);
        }
        a.add(b)
    }
}

impl fmt::Display for PaillierPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.n.to_str_radix(10))
    }
}

impl FromStr for PaillierPublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: BigUint = s
            .trim()
            .parse()
            .map_err(|_| CryptoError::Malformed("paillier modulus".into()))?;
        Self::from_modulus(n)
    }
}

/// Paillier private key; holds its public half
#[derive(Clone)]
pub struct PaillierPrivateKey {
    public: PaillierPublicKey,
    lambda: BigUint,
    mu: BigUint,
}

impl fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaillierPrivateKey")
            .field("modulus_bits", &self.public.modulus_bits())
            .finish_non_exhaustive()
    }
}

impl PaillierPrivateKey {
    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.public
    }

    /// Decrypt to the encoded non-negative integer `m * 16^exponent`
    pub fn decrypt(&self, ciphertext: &PaillierCiphertext) -> Result<BigUint, CryptoError> {
        if ciphertext.modulus != self.public.n {
            return Err(CryptoError::ModulusMismatch);
        }

        let n = &self.public.n;
        let n_squared = self.public.modulus_squared();
        if ciphertext.value >= n_squared {
            return Err(CryptoError::Malformed("paillier ciphertext".into()));
        }

        let x = ciphertext.value.modpow(&self.lambda, &n_squared);
        if x.is_zero() {
            return Err(CryptoError::Malformed("paillier ciphertext".into()));
        }
        let l = (x - 1u32) / n;
        let encoded = (l * &self.mu) % n;

        decode_exponent(encoded, ciphertext.exponent)
    }
}

fn check_exponent(exponent: i32) -> Result<(), CryptoError> {
    if exponent.unsigned_abs() > MAX_EXPONENT {
        return Err(CryptoError::InvalidExponent {
            from: exponent,
            to: 0,
        });
    }
    Ok(())
}

fn decode_exponent(encoded: BigUint, exponent: i32) -> Result<BigUint, CryptoError> {
    check_exponent(exponent)?;
    let base = BigUint::from(EXPONENT_BASE);
    if exponent >= 0 {
        return Ok(encoded * base.pow(exponent.unsigned_abs()));
    }

    let divisor = base.pow(exponent.unsigned_abs());
    let (quotient, remainder) = encoded.div_rem(&divisor);
    if !remainder.is_zero() {
        return Err(CryptoError::NonIntegral { exponent });
    }
    Ok(quotient)
}

/// Generate a Paillier keypair with a modulus of `bits` bits
pub fn generate_keypair(bits: u64) -> Result<(PaillierPublicKey, PaillierPrivateKey), CryptoError> {
    if bits < MIN_MODULUS_BITS || bits % 2 != 0 {
        return Err(CryptoError::InvalidKeySize(bits));
    }

    let mut rng = rand::thread_rng();
    loop {
        let p = generate_prime(bits / 2, &mut rng);
        let q = generate_prime(bits / 2, &mut rng);
        if p == q {
            continue;
        }

        let n = &p * &q;
        let lambda = (&p - 1u32).lcm(&(&q - 1u32));
        // With g = n + 1, L(g^λ mod n²) = λ mod n
        let Some(mu) = mod_inverse(&(&lambda % &n), &n) else {
            continue;
        };

        log::debug!("generated paillier keypair ({} bits)", n.bits());
        let public = PaillierPublicKey { n };
        let private = PaillierPrivateKey {
            public: public.clone(),
            lambda,
            mu,
        };
        return Ok((public, private));
    }
}

/// A Paillier ciphertext bound to its public modulus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaillierCiphertext {
    #[serde(with = "decimal")]
    modulus: BigUint,
    #[serde(with = "decimal")]
    value: BigUint,
    exponent: i32,
}

impl PaillierCiphertext {
    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Whether both ciphertexts were produced under the same public modulus
    pub fn same_key(&self, other: &Self) -> bool {
        self.modulus == other.modulus
    }

    /// Homomorphic addition; exponents are aligned to the smaller one
    pub fn add(&self, other: &Self) -> Result<Self, CryptoError> {
        if !self.same_key(other) {
            return Err(CryptoError::ModulusMismatch);
        }

        let exponent = self.exponent.min(other.exponent);
        let a = self.decrease_exponent_to(exponent)?;
        let b = other.decrease_exponent_to(exponent)?;
        let n_squared = &self.modulus * &self.modulus;

        Ok(Self {
            modulus: self.modulus.clone(),
            value: (a.value * b.value) % n_squared,
            exponent,
        })
    }

    /// Re-encode at a lower exponent by homomorphic scalar multiplication
    pub fn decrease_exponent_to(&self, exponent: i32) -> Result<Self, CryptoError> {
        if exponent > self.exponent {
            return Err(CryptoError::InvalidExponent {
                from: self.exponent,
                to: exponent,
            });
        }
        if exponent == self.exponent {
            return Ok(self.clone());
        }

        let invalid = CryptoError::InvalidExponent {
            from: self.exponent,
            to: exponent,
        };
        let shift = self
            .exponent
            .checked_sub(exponent)
            .map(i32::unsigned_abs)
            .filter(|shift| *shift <= MAX_EXPONENT)
            .ok_or(invalid)?;
        let factor = BigUint::from(EXPONENT_BASE).pow(shift);
        let n_squared = &self.modulus * &self.modulus;

        Ok(Self {
            modulus: self.modulus.clone(),
            value: self.value.modpow(&factor, &n_squared),
            exponent,
        })
    }
}
