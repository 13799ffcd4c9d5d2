//! Mints DIDs from user attributes and a freshly generated key pair.

use anchor_core::{UserId, DID_PREFIX, DID_SEGMENT_LEN};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::hashing::sha256_hex;
use crate::keys::{KeyPair, PublicKey};

const SALT_LEN: usize = 16;

/// How the user hash is derived from name and email.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// `sha256(name:email:salt)` with a random per-identity salt. The salt is
    /// stored so the hash can be recomputed.
    #[default]
    Salted,
    /// `sha256(name:email:unix_seconds)`. Not reproducible.
    Timestamped,
}

/// Output of one generation. The secret half of the key pair is dropped
/// (and zeroized) before this is returned.
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    pub did: String,
    pub user_hash: String,
    pub hash_salt: Option<String>,
    pub public_key: PublicKey,
}

/// Pure DID generator. Has no side effects beyond reading the RNG.
#[derive(Debug, Clone, Default)]
pub struct IdentityGenerator {
    policy: HashPolicy,
}

impl IdentityGenerator {
    pub fn new(policy: HashPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> HashPolicy {
        self.policy
    }

    /// Generate a DID for the given user using OS entropy.
    pub fn generate(
        &self,
        user_id: UserId,
        name: &str,
        email: &str,
    ) -> Result<GeneratedIdentity, CryptoError> {
        self.generate_with(&mut OsRng, user_id, name, email)
    }

    /// Generate a DID drawing all randomness from `rng`.
    ///
    /// Fails with [`CryptoError::KeyGenerationError`] if the RNG cannot
    /// provide entropy; nothing is produced in that case.
    pub fn generate_with<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        user_id: UserId,
        name: &str,
        email: &str,
    ) -> Result<GeneratedIdentity, CryptoError> {
        let keypair = KeyPair::generate_with(rng)?;
        let public_key = keypair.public_key();
        drop(keypair);

        let (user_hash, hash_salt) = match self.policy {
            HashPolicy::Salted => {
                let mut salt = [0u8; SALT_LEN];
                rng.try_fill_bytes(&mut salt).map_err(|e| {
                    CryptoError::KeyGenerationError(format!("entropy unavailable: {}", e))
                })?;
                let salt_hex = hex::encode(salt);
                (user_hash_for(name, email, &salt_hex), Some(salt_hex))
            }
            HashPolicy::Timestamped => {
                let stamp = Utc::now().timestamp().to_string();
                (user_hash_for(name, email, &stamp), None)
            }
        };

        let did = compose_did(&user_hash, &public_key);

        tracing::debug!(%user_id, did = %did, policy = ?self.policy, "generated DID");

        Ok(GeneratedIdentity {
            did,
            user_hash,
            hash_salt,
            public_key,
        })
    }
}

/// Recompute a user hash from its inputs.
pub fn user_hash_for(name: &str, email: &str, salt: &str) -> String {
    sha256_hex(format!("{}:{}:{}", name, email, salt).as_bytes())
}

/// `did:example:user:<first 16 hex of hash>:<first 16 hex of public key>`.
pub fn compose_did(user_hash: &str, public_key: &PublicKey) -> String {
    let key_hex = public_key.to_hex();
    let hash_part = user_hash.get(..DID_SEGMENT_LEN).unwrap_or(user_hash);
    format!(
        "{}{}:{}",
        DID_PREFIX,
        hash_part,
        &key_hex[..DID_SEGMENT_LEN]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_core::validate_did;

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new("entropy pool closed"))
        }
    }

    impl CryptoRng for BrokenRng {}

    #[test]
    fn test_did_format() {
        let generator = IdentityGenerator::default();
        let id = generator
            .generate(UserId::new(), "Alice", "alice@example.com")
            .unwrap();
        assert!(validate_did(&id.did).is_ok());
        assert_eq!(id.user_hash.len(), 64);
        assert!(id.did.starts_with(&format!("{}{}", DID_PREFIX, &id.user_hash[..16])));
        assert!(id.did.ends_with(&id.public_key.to_hex()[..16]));
    }

    #[test]
    fn test_salted_hash_recomputable() {
        let generator = IdentityGenerator::new(HashPolicy::Salted);
        let id = generator.generate(UserId::new(), "Bob", "bob@example.com").unwrap();
        let salt = id.hash_salt.clone().unwrap();
        assert_eq!(salt.len(), SALT_LEN * 2);
        assert_eq!(user_hash_for("Bob", "bob@example.com", &salt), id.user_hash);
    }

    #[test]
    fn test_same_user_gets_distinct_dids() {
        let generator = IdentityGenerator::new(HashPolicy::Salted);
        let a = generator.generate(UserId::new(), "Eve", "eve@example.com").unwrap();
        let b = generator.generate(UserId::new(), "Eve", "eve@example.com").unwrap();
        assert_ne!(a.user_hash, b.user_hash);
        assert_ne!(a.did, b.did);
    }

    #[test]
    fn test_timestamped_policy_has_no_salt() {
        let generator = IdentityGenerator::new(HashPolicy::Timestamped);
        let id = generator.generate(UserId::new(), "Carol", "carol@example.com").unwrap();
        assert!(id.hash_salt.is_none());
        assert!(validate_did(&id.did).is_ok());
    }

    #[test]
    fn test_entropy_failure_is_reported() {
        let generator = IdentityGenerator::default();
        let result = generator.generate_with(&mut BrokenRng, UserId::new(), "Dan", "dan@example.com");
        assert!(matches!(result, Err(CryptoError::KeyGenerationError(_))));
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(serde_json::to_string(&HashPolicy::Salted).unwrap(), "\"salted\"");
        let p: HashPolicy = serde_json::from_str("\"timestamped\"").unwrap();
        assert_eq!(p, HashPolicy::Timestamped);
    }
}
