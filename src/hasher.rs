use argon2::{Config, Variant, Version};
use rand::{rngs::OsRng, RngCore};
use tracing::warn;

use crate::{error::AuthError, types::HashedPassword};

const SALT_LEN: usize = 16;

/// Salted, deliberately slow one-way hashing of user passwords (argon2id).
///
/// Every call to [`PasswordHasher::hash`] draws a fresh salt from the OS, so the
/// same password never hashes to the same string twice. The salt and the cost
/// parameters travel inside the encoded hash, which means the costs can be
/// raised later without invalidating existing accounts.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    /// Number of argon2 passes over memory.
    pub time_cost: u32,
    /// Memory used per hash, in KiB.
    pub mem_cost: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            time_cost: 3,
            mem_cost: 4096,
        }
    }
}

impl PasswordHasher {
    pub fn new(time_cost: u32, mem_cost: u32) -> Self {
        Self {
            time_cost,
            mem_cost,
        }
    }

    pub fn hash(&self, password: &str) -> Result<HashedPassword, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.try_fill_bytes(&mut salt).map_err(AuthError::hashing)?;

        let config = Config {
            variant: Variant::Argon2id,
            version: Version::Version13,
            time_cost: self.time_cost,
            mem_cost: self.mem_cost,
            ..Config::default()
        };

        let encoded =
            argon2::hash_encoded(password.as_bytes(), &salt, &config).map_err(AuthError::hashing)?;

        Ok(HashedPassword(encoded))
    }

    /// Returns false on mismatch. A hash that cannot be decoded is treated as a
    /// mismatch too, so a corrupt record can never authenticate.
    pub fn verify(&self, password: &str, hash: &HashedPassword) -> bool {
        match argon2::verify_encoded(&hash.0, password.as_bytes()) {
            Ok(matches) => matches,
            Err(err) => {
                warn!("stored password hash could not be decoded: {err}");
                false
            }
        }
    }
}
