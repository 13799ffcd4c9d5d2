pub mod error;
pub mod generator;
pub mod hashing;
pub mod keys;
pub mod signing;

pub use error::CryptoError;
pub use generator::{compose_did, user_hash_for, GeneratedIdentity, HashPolicy, IdentityGenerator};
pub use hashing::{hash, hash_hex, sha256, sha256_hex};
pub use keys::{KeyPair, PublicKey};
pub use signing::{sign, verify, Signature};
