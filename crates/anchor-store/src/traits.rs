use anchor_core::{BlockchainJob, DidId, DidRecord, DidStatus, JobId, JobStatus, UserId};
use async_trait::async_trait;

use crate::error::StoreError;

/// Durable CRUD for Identity Records.
///
/// `did` and `user_hash` are unique. Lookups that miss return
/// [`StoreError::NotFound`].
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id, DID or user hash
    /// is already taken.
    async fn create(&self, record: &DidRecord) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &DidId) -> Result<DidRecord, StoreError>;

    async fn get_by_did(&self, did: &str) -> Result<DidRecord, StoreError>;

    /// The most recently created record for the user.
    async fn get_by_user_id(&self, user_id: &UserId) -> Result<DidRecord, StoreError>;

    async fn get_by_user_hash(&self, user_hash: &str) -> Result<DidRecord, StoreError>;

    /// Replace a record. The DID, user hash and owner are immutable.
    async fn update(&self, record: &DidRecord) -> Result<DidRecord, StoreError>;

    /// Set the status, and the chain transaction when one is given.
    async fn update_status(
        &self,
        id: &DidId,
        status: DidStatus,
        chain_tx: Option<&str>,
    ) -> Result<DidRecord, StoreError>;

    /// All records in the given status, oldest first.
    async fn list_by_status(&self, status: DidStatus) -> Result<Vec<DidRecord>, StoreError>;
}

/// Durable record of chain operations and their retry state.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn create(&self, job: &BlockchainJob) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &JobId) -> Result<BlockchainJob, StoreError>;

    /// Eligible jobs (pending or retrying with budget left), oldest first.
    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError>;

    /// Unconditionally set status and error text.
    async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<BlockchainJob, StoreError>;

    /// `processing → completed`, stamping `processed_at`.
    async fn mark_completed(&self, id: &JobId) -> Result<BlockchainJob, StoreError>;

    /// Record a recoverable failure: status becomes `retrying`, the counter
    /// goes up by one and `error` is kept.
    async fn increment_retry_count(
        &self,
        id: &JobId,
        error: &str,
    ) -> Result<BlockchainJob, StoreError>;

    /// Delete completed jobs processed more than `older_than_days` ago.
    async fn cleanup_completed(&self, older_than_days: u32) -> Result<usize, StoreError>;

    /// Atomically move an eligible job to `processing`.
    ///
    /// Returns `None` when the job is not eligible, including when another
    /// driver claimed it first.
    async fn claim(&self, id: &JobId) -> Result<Option<BlockchainJob>, StoreError>;

    /// Refresh the lease on a job still in `processing`. Returns `false` when
    /// the claim is gone: released, failed or completed by someone else.
    async fn renew_claim(&self, id: &JobId) -> Result<bool, StoreError>;

    async fn record_tx_ref(&self, id: &JobId, tx_ref: &str) -> Result<(), StoreError>;

    async fn list_by_did_ref(&self, did_ref: &DidId) -> Result<Vec<BlockchainJob>, StoreError>;

    /// Failed jobs and retrying jobs with no budget left, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError>;

    /// Put a dead-lettered job back to `pending` with a fresh retry budget.
    async fn requeue(&self, id: &JobId) -> Result<BlockchainJob, StoreError>;

    /// Return `processing` jobs whose claim is older than `lease` to
    /// `retrying`, counting the lost attempt.
    async fn release_stale_claims(
        &self,
        lease: chrono::Duration,
    ) -> Result<Vec<BlockchainJob>, StoreError>;
}
