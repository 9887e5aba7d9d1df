//! Post-quantum lattice encryption
//!
//! ML-KEM encapsulates a fresh shared secret per message; the message is padded to a
//! fixed block and XORed with a BLAKE3 keystream derived from that secret. There is
//! no authentication tag: decrypting with the wrong secret key decapsulates to an
//! unrelated secret (implicit rejection) and produces garbage, never an error.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use pqcrypto_mlkem::{mlkem768, mlkem1024};
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use serde::{Deserialize, Serialize};

use crate::encoding::hex_bytes;
use crate::error::CryptoError;

/// Largest plaintext accepted by [`LatticePublicKey::encrypt`]
pub const MAX_MESSAGE_LEN: usize = 128;

/// Padded block: message, one marker byte, zero fill
const BLOCK_LEN: usize = MAX_MESSAGE_LEN + 1;
const PAD_MARKER: u8 = 0x80;
const DEM_CONTEXT: &str = "tally-lattice-dem-v1";

/// Parameter set of the lattice scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatticeParams {
    #[default]
    MlKem768,
    MlKem1024,
}

impl LatticeParams {
    pub fn name(&self) -> &'static str {
        match self {
            LatticeParams::MlKem768 => "mlkem768",
            LatticeParams::MlKem1024 => "mlkem1024",
        }
    }

    fn public_key_len(&self) -> usize {
        match self {
            LatticeParams::MlKem768 => mlkem768::public_key_bytes(),
            LatticeParams::MlKem1024 => mlkem1024::public_key_bytes(),
        }
    }

    fn kem_ciphertext_len(&self) -> usize {
        match self {
            LatticeParams::MlKem768 => mlkem768::ciphertext_bytes(),
            LatticeParams::MlKem1024 => mlkem1024::ciphertext_bytes(),
        }
    }

    /// Total length of a lattice ciphertext under these parameters
    pub fn ciphertext_len(&self) -> usize {
        self.kem_ciphertext_len() + BLOCK_LEN
    }
}

impl fmt::Display for LatticeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LatticeParams {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mlkem768" => Ok(LatticeParams::MlKem768),
            "mlkem1024" => Ok(LatticeParams::MlKem1024),
            other => Err(CryptoError::Malformed(format!("lattice parameter set {other}"))),
        }
    }
}

/// Lattice public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatticePublicKey {
    params: LatticeParams,
    #[serde(with = "hex_bytes")]
    bytes: Vec<u8>,
}

impl LatticePublicKey {
    pub fn from_bytes(params: LatticeParams, bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != params.public_key_len() {
            return Err(CryptoError::Malformed(format!("{params} public key")));
        }
        Ok(Self { params, bytes })
    }

    pub fn params(&self) -> LatticeParams {
        self.params
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encrypt up to [`MAX_MESSAGE_LEN`] bytes
    pub fn encrypt(&self, message: &[u8]) -> Result<LatticeCiphertext, CryptoError> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(CryptoError::MessageTooLong {
                len: message.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let (shared, kem_ct) = encapsulate(self.params, &self.bytes)?;
        let mut block = pad(message);
        apply_keystream(&shared, &kem_ct, &mut block);

        let mut bytes = kem_ct;
        bytes.extend_from_slice(&block);
        Ok(LatticeCiphertext {
            params: self.params,
            bytes,
        })
    }

    /// Encrypt a non-negative integer as its decimal text
    pub fn encrypt_integer(&self, value: &BigUint) -> Result<LatticeCiphertext, CryptoError> {
        self.encrypt(value.to_str_radix(10).as_bytes())
    }
}

impl fmt::Display for LatticePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.params, hex::encode(&self.bytes))
    }
}

impl FromStr for LatticePublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (params, body) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CryptoError::Malformed("lattice public key".into()))?;
        let params: LatticeParams = params.parse()?;
        let bytes =
            hex::decode(body).map_err(|_| CryptoError::Malformed("lattice public key".into()))?;
        Self::from_bytes(params, bytes)
    }
}

/// Lattice keypair; the secret half never leaves its holder
#[derive(Clone)]
pub struct LatticeKeyPair {
    public: LatticePublicKey,
    secret: Vec<u8>,
}

impl fmt::Debug for LatticeKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatticeKeyPair")
            .field("public", &self.public.to_string())
            .finish_non_exhaustive()
    }
}

impl LatticeKeyPair {
    pub fn generate(params: LatticeParams) -> Self {
        let (public, secret) = match params {
            LatticeParams::MlKem768 => {
                let (pk, sk) = mlkem768::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
            LatticeParams::MlKem1024 => {
                let (pk, sk) = mlkem1024::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
        };
        log::debug!("generated {params} keypair");

        Self {
            public: LatticePublicKey {
                params,
                bytes: public,
            },
            secret,
        }
    }

    pub fn public_key(&self) -> &LatticePublicKey {
        &self.public
    }

    /// Decrypt a ciphertext; a ciphertext for another key yields unrelated bytes
    pub fn decrypt(&self, ciphertext: &LatticeCiphertext) -> Result<Vec<u8>, CryptoError> {
        let params = self.public.params;
        if ciphertext.params != params {
            return Err(CryptoError::Malformed(format!(
                "{} ciphertext for a {params} key",
                ciphertext.params
            )));
        }
        if ciphertext.bytes.len() != params.ciphertext_len() {
            return Err(CryptoError::Malformed(format!("{params} ciphertext")));
        }

        let (kem_ct, body) = ciphertext.bytes.split_at(params.kem_ciphertext_len());
        let shared = decapsulate(params, kem_ct, &self.secret)?;

        let mut block = body.to_vec();
        apply_keystream(&shared, kem_ct, &mut block);
        Ok(unpad(block))
    }

    /// Decrypt an integer produced by [`LatticePublicKey::encrypt_integer`]
    pub fn decrypt_integer(&self, ciphertext: &LatticeCiphertext) -> Result<BigUint, CryptoError> {
        let bytes = self.decrypt(ciphertext)?;
        std::str::from_utf8(&bytes)
            .ok()
            .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| CryptoError::Malformed("lattice integer plaintext".into()))
    }
}

/// Lattice ciphertext: KEM ciphertext followed by the masked block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatticeCiphertext {
    params: LatticeParams,
    #[serde(with = "hex_bytes")]
    bytes: Vec<u8>,
}

impl LatticeCiphertext {
    pub fn params(&self) -> LatticeParams {
        self.params
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn encapsulate(params: LatticeParams, public: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let malformed = |_| CryptoError::Malformed(format!("{params} public key"));
    Ok(match params {
        LatticeParams::MlKem768 => {
            let pk = mlkem768::PublicKey::from_bytes(public).map_err(malformed)?;
            let (ss, ct) = mlkem768::encapsulate(&pk);
            (ss.as_bytes().to_vec(), ct.as_bytes().to_vec())
        }
        LatticeParams::MlKem1024 => {
            let pk = mlkem1024::PublicKey::from_bytes(public).map_err(malformed)?;
            let (ss, ct) = mlkem1024::encapsulate(&pk);
            (ss.as_bytes().to_vec(), ct.as_bytes().to_vec())
        }
    })
}

fn decapsulate(params: LatticeParams, kem_ct: &[u8], secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let malformed = |_| CryptoError::Malformed(format!("{params} ciphertext"));
    Ok(match params {
        LatticeParams::MlKem768 => {
            let ct = mlkem768::Ciphertext::from_bytes(kem_ct).map_err(malformed)?;
            let sk = mlkem768::SecretKey::from_bytes(secret).map_err(malformed)?;
            mlkem768::decapsulate(&ct, &sk).as_bytes().to_vec()
        }
        LatticeParams::MlKem1024 => {
            let ct = mlkem1024::Ciphertext::from_bytes(kem_ct).map_err(malformed)?;
            let sk = mlkem1024::SecretKey::from_bytes(secret).map_err(malformed)?;
            mlkem1024::decapsulate(&ct, &sk).as_bytes().to_vec()
        }
    })
}

fn apply_keystream(shared: &[u8], kem_ct: &[u8], block: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(DEM_CONTEXT);
    hasher.update(shared);
    hasher.update(kem_ct);

    let mut stream = vec![0u8; block.len()];
    hasher.finalize_xof().fill(&mut stream);
    for (b, k) in block.iter_mut().zip(stream) {
        *b ^= k;
    }
}

fn pad(message: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(BLOCK_LEN);
    block.extend_from_slice(message);
    block.push(PAD_MARKER);
    block.resize(BLOCK_LEN, 0);
    block
}

/// Strip padding; a block without a marker is returned whole
fn unpad(mut block: Vec<u8>) -> Vec<u8> {
    match block.iter().rposition(|b| *b != 0) {
        Some(pos) if block[pos] == PAD_MARKER => {
            block.truncate(pos);
            block
        }
        _ => block,
    }
}
