use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::did_state::DidStatus;
use crate::error::CoreError;
use crate::job_state::JobStatus;

/// Method prefix shared by every DID minted here.
pub const DID_PREFIX: &str = "did:example:user:";

/// Hex characters taken from the user hash and from the public key.
pub const DID_SEGMENT_LEN: usize = 16;

/// Retry budget a job is created with.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new time-ordered identifier (UUID v7).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::ValidationError(format!("invalid id {}: {}", s, e)))
            }
        }
    };
}

uuid_id!(
    /// Identity Record identifier.
    DidId
);
uuid_id!(
    /// Blockchain Job identifier.
    JobId
);
uuid_id!(
    /// Opaque reference to the owning user in the external account system.
    UserId
);

/// Check that a DID string has the shape
/// `did:example:user:<16 hex>:<16 hex>` (lowercase hex).
pub fn validate_did(did: &str) -> Result<(), CoreError> {
    let rest = did
        .strip_prefix(DID_PREFIX)
        .ok_or_else(|| CoreError::InvalidDid(format!("DID must start with '{}'", DID_PREFIX)))?;
    let mut parts = rest.split(':');
    let (Some(hash), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CoreError::InvalidDid(format!(
            "expected '{}<hash>:<key>', got {}",
            DID_PREFIX, did
        )));
    };
    for segment in [hash, key] {
        let lower_hex = segment
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if segment.len() != DID_SEGMENT_LEN || !lower_hex {
            return Err(CoreError::InvalidDid(format!(
                "segment '{}' is not {} lowercase hex chars",
                segment, DID_SEGMENT_LEN
            )));
        }
    }
    Ok(())
}

/// A locally minted DID and its anchoring state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRecord {
    pub id: DidId,
    pub user_id: UserId,
    /// `did:example:user:<hash prefix>:<key prefix>`, globally unique.
    pub did: String,
    /// SHA-256 hex digest of the user's identity attributes, unique.
    pub user_hash: String,
    /// Hex salt mixed into `user_hash` under the salted policy.
    #[serde(default)]
    pub hash_salt: Option<String>,
    /// Hex-encoded Ed25519 public key. The secret half is never stored.
    pub public_key: String,
    pub status: DidStatus,
    /// Registry transaction that last anchored this DID.
    #[serde(default)]
    pub chain_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DidRecord {
    /// Build a fresh `pending` record.
    pub fn new(
        user_id: UserId,
        did: String,
        user_hash: String,
        hash_salt: Option<String>,
        public_key: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DidId::new(),
            user_id,
            did,
            user_hash,
            hash_salt,
            public_key,
            status: DidStatus::Pending,
            chain_tx: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The registry operation a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Register,
    Update,
    Revoke,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Update => "update",
            Self::Revoke => "revoke",
        }
    }

    pub fn all() -> [JobType; 3] {
        [Self::Register, Self::Update, Self::Revoke]
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(Self::Register),
            "update" => Ok(Self::Update),
            "revoke" => Ok(Self::Revoke),
            other => Err(CoreError::UnknownJobType(other.to_string())),
        }
    }
}

/// One attempt-tracked chain operation for an Identity Record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainJob {
    pub id: JobId,
    pub job_type: JobType,
    /// The Identity Record this job anchors.
    pub did_ref: DidId,
    pub user_hash: String,
    pub did: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Last failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Transaction produced by the most recent submission, if any.
    #[serde(default)]
    pub last_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl BlockchainJob {
    /// Build a fresh `pending` job for the given record.
    pub fn new(job_type: JobType, record: &DidRecord, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type,
            did_ref: record.id,
            user_hash: record.user_hash.clone(),
            did: record.did.clone(),
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            error: None,
            last_tx_ref: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Whether any driver may pick this job up right now.
    pub fn is_eligible(&self) -> bool {
        self.status.is_claimable() && self.retry_count < self.max_retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Terminal without success: failed, or retrying with no budget left.
    pub fn is_dead_letter(&self) -> bool {
        match self.status {
            JobStatus::Failed => true,
            JobStatus::Retrying => self.is_exhausted(),
            _ => false,
        }
    }
}
