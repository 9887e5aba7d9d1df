//! Probable-prime generation for homomorphic key material.

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;

/// Witness rounds; error probability is at most 4^-40
pub const MILLER_RABIN_ROUNDS: usize = 40;

const SMALL_PRIMES: [u32; 54] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

/// Generate a random prime of exactly `bits` bits.
///
/// The two top bits are forced so the product of two such primes has exactly
/// `2 * bits` bits.
pub fn generate_prime<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> BigUint {
    debug_assert!(bits >= 16);
    let top = (BigUint::one() << (bits - 1)) | (BigUint::one() << (bits - 2)) | BigUint::one();

    loop {
        let candidate = rng.gen_biguint(bits) | &top;
        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS, rng) {
            return candidate;
        }
    }
}

/// Miller-Rabin primality test with trial division by small primes first
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }

    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }

    true
}

/// Modular inverse via the extended Euclidean algorithm
pub fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    use num_bigint::BigInt;

    let a = BigInt::from(a.clone());
    let m = BigInt::from(modulus.clone());
    let egcd = a.extended_gcd(&m);
    if !egcd.gcd.is_one() {
        return None;
    }
    egcd.x.mod_floor(&m).to_biguint()
}
