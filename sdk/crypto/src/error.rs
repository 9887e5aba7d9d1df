use thiserror::Error;

/// Cryptographic and decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("ciphertexts were produced under different public moduli")]
    ModulusMismatch,

    #[error("plaintext does not fit below the public modulus ({modulus_bits} bits)")]
    PlaintextOverflow { modulus_bits: u64 },

    #[error("cannot raise ciphertext exponent from {from} to {to}")]
    InvalidExponent { from: i32, to: i32 },

    #[error("decrypted value is not an integer at exponent {exponent}")]
    NonIntegral { exponent: i32 },

    #[error("message of {len} bytes exceeds the {max} byte bound")]
    MessageTooLong { len: usize, max: usize },

    #[error("expected a {expected} key or ciphertext, got {got}")]
    SchemeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid key size: {0} bits")]
    InvalidKeySize(u64),

    #[error("malformed {0}")]
    Malformed(String),
}
