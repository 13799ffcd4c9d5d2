use std::time::Duration;

use anchor_core::DEFAULT_MAX_RETRIES;

/// Reconciliation Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Jobs processed per poll tick.
    pub batch_size: usize,
    /// Retry budget given to jobs the worker creates itself.
    pub max_retries: u32,
    /// A `processing` claim older than this is considered abandoned.
    pub claim_lease: Duration,
    /// Pending identities younger than this are not treated as orphans.
    pub orphan_grace: Duration,
    pub completed_retention_days: u32,
    pub retention_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            claim_lease: Duration::from_secs(600),
            orphan_grace: Duration::from_secs(60),
            completed_retention_days: 7,
            retention_interval: Duration::from_secs(3600),
        }
    }
}
