use serde::{Deserialize, Serialize};

/// Registry answer for a DID lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Registered and not revoked.
    pub is_valid: bool,
    /// The user hash the DID was registered with, if it is known at all.
    #[serde(default)]
    pub user_hash: Option<String>,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: u64,
    pub active: u64,
    pub revoked: u64,
}
