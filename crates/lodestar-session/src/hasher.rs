//! Password hashing seam.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Turns passwords into stored hashes and checks them.
///
/// The hash format is owned entirely by the implementation; the rest of
/// Lodestar only stores and hands back the string.
pub trait PasswordHasher: Send + Sync + 'static {
    fn hash(&self, password: &str) -> String;

    /// Returns `true` if `password` produced `hash`. Malformed hashes
    /// verify as `false`.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Salted SHA-256: `"{salt}${hex(sha256(salt || password))}"`.
///
/// Fine for development and tests. A production deployment should plug in
/// a deliberately slow hasher behind the same trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256PasswordHasher;

impl Sha256PasswordHasher {
    fn digest(salt: &str, password: &str) -> String {
        let digest = Sha256::new()
            .chain_update(salt.as_bytes())
            .chain_update(password.as_bytes())
            .finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> String {
        let salt: [u8; 16] = rand::rng().random();
        let salt: String = salt.iter().map(|b| format!("{b:02x}")).collect();
        let digest = Self::digest(&salt, password);
        format!("{salt}${digest}")
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        let Some((salt, expected)) = hash.split_once('$') else {
            return false;
        };
        constant_time_eq(Self::digest(salt, password).as_bytes(), expected.as_bytes())
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
