//! Identity Service: issues identities, answers verification queries and
//! enqueues registry work.
//!
//! Creation is not transactional across the Identity Store, the Job Ledger
//! and the Queue Transport. Each step is durable before the next starts and
//! the Reconciliation Worker repairs whatever a crash leaves behind.

use std::sync::Arc;

use anchor_core::{
    BlockchainJob, DidEvent, DidRecord, DidStateMachine, DidStatus, JobId, JobStatus, JobType,
    UserId, DEFAULT_MAX_RETRIES,
};
use anchor_crypto::IdentityGenerator;
use anchor_ledger::{LedgerClient, RegistryStats};
use anchor_queue::QueueTransport;
use anchor_store::{IdentityStore, JobLedger};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Why a verification came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationReason {
    /// The registry reports the DID active.
    Verified,
    /// No local record carries this DID.
    NotFound,
    /// The supplied user hash differs from the stored one.
    HashMismatch,
    /// The registry does not report the DID active.
    NotRegistered,
    /// The registry could not be reached; the answer comes from local state.
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub is_valid: bool,
    pub did: String,
    pub user_hash: Option<String>,
    pub status: Option<DidStatus>,
    pub chain_tx: Option<String>,
    pub reason: VerificationReason,
    pub message: String,
}

impl VerificationResponse {
    fn not_found(did: &str) -> Self {
        Self {
            is_valid: false,
            did: did.to_string(),
            user_hash: None,
            status: None,
            chain_tx: None,
            reason: VerificationReason::NotFound,
            message: "DID not found".into(),
        }
    }

    fn for_record(record: &DidRecord, is_valid: bool, reason: VerificationReason) -> Self {
        let message = match reason {
            VerificationReason::Verified => "DID is registered and active".to_string(),
            VerificationReason::NotFound => "DID not found".to_string(),
            VerificationReason::HashMismatch => "user hash does not match".to_string(),
            VerificationReason::NotRegistered => {
                format!("DID is not active on the registry (local status: {})", record.status)
            }
            VerificationReason::LocalFallback => {
                format!("registry unavailable, using local status: {}", record.status)
            }
        };
        Self {
            is_valid,
            did: record.did.clone(),
            user_hash: Some(record.user_hash.clone()),
            status: Some(record.status),
            chain_tx: record.chain_tx.clone(),
            reason,
            message,
        }
    }
}

/// Result of [`IdentityService::create`].
#[derive(Debug, Clone, Serialize)]
pub struct CreatedIdentity {
    pub record: DidRecord,
    /// `None` if the registration job could not be written; the worker's
    /// orphan sweep creates it later.
    pub job: Option<BlockchainJob>,
}

pub struct IdentityService {
    generator: IdentityGenerator,
    identities: Arc<dyn IdentityStore>,
    jobs: Arc<dyn JobLedger>,
    queue: Arc<dyn QueueTransport>,
    ledger: LedgerClient,
    max_retries: u32,
}

impl IdentityService {
    pub fn new(
        generator: IdentityGenerator,
        identities: Arc<dyn IdentityStore>,
        jobs: Arc<dyn JobLedger>,
        queue: Arc<dyn QueueTransport>,
        ledger: LedgerClient,
    ) -> Self {
        Self {
            generator,
            identities,
            jobs,
            queue,
            ledger,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry budget given to jobs this service creates.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Issue a new identity for `user_id` and schedule its registration.
    ///
    /// Returns once the record and the registration job are persisted. A
    /// user whose previous identity failed may be issued a fresh one; any
    /// other existing identity is a conflict.
    pub async fn create(
        &self,
        user_id: UserId,
        name: &str,
        email: &str,
    ) -> Result<CreatedIdentity, ServiceError> {
        if name.trim().is_empty() || email.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "name and email are required".into(),
            ));
        }

        match self.identities.get_by_user_id(&user_id).await {
            Ok(existing) if existing.status != DidStatus::Failed => {
                return Err(ServiceError::Conflict(format!(
                    "user {} already has DID {}",
                    user_id, existing.did
                )));
            }
            Ok(_) | Err(anchor_store::StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let generated = self.generator.generate(user_id, name, email)?;
        let record = DidRecord::new(
            user_id,
            generated.did,
            generated.user_hash,
            generated.hash_salt,
            generated.public_key.to_hex(),
        );
        self.identities.create(&record).await?;
        tracing::info!(did = %record.did, user_id = %user_id, "identity created");

        let job = BlockchainJob::new(JobType::Register, &record, self.max_retries);
        if let Err(e) = self.jobs.create(&job).await {
            tracing::warn!(did = %record.did, error = %e, "registration job not persisted; left to orphan sweep");
            return Ok(CreatedIdentity { record, job: None });
        }
        self.publish(&job).await;

        Ok(CreatedIdentity {
            record,
            job: Some(job),
        })
    }

    /// Verify `did`, optionally checking that `user_hash` matches.
    ///
    /// An unknown DID or a mismatched hash is an answer, not an error. If the
    /// registry is unreachable the local status decides.
    pub async fn verify(
        &self,
        did: &str,
        user_hash: Option<&str>,
    ) -> Result<VerificationResponse, ServiceError> {
        let record = match self.identities.get_by_did(did).await {
            Ok(record) => record,
            Err(anchor_store::StoreError::NotFound(_)) => {
                return Ok(VerificationResponse::not_found(did))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(expected) = user_hash.filter(|h| !h.is_empty()) {
            if expected != record.user_hash {
                return Ok(VerificationResponse::for_record(
                    &record,
                    false,
                    VerificationReason::HashMismatch,
                ));
            }
        }

        let entry = match self.ledger.lookup(did).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(did, error = %e, "registry lookup failed, falling back to local status");
                let is_valid = record.status == DidStatus::Active;
                return Ok(VerificationResponse::for_record(
                    &record,
                    is_valid,
                    VerificationReason::LocalFallback,
                ));
            }
        };

        if !entry.is_valid {
            return Ok(VerificationResponse::for_record(
                &record,
                false,
                VerificationReason::NotRegistered,
            ));
        }

        let record = self.heal(record).await;
        Ok(VerificationResponse::for_record(
            &record,
            true,
            VerificationReason::Verified,
        ))
    }

    /// Registry has the DID active but the local record lags behind.
    async fn heal(&self, record: DidRecord) -> DidRecord {
        if record.status == DidStatus::Active
            || !DidStateMachine::can_transition(record.status, DidEvent::Confirm)
        {
            return record;
        }
        match self
            .identities
            .update_status(&record.id, DidStatus::Active, None)
            .await
        {
            Ok(healed) => {
                tracing::info!(did = %healed.did, from = %record.status, "local status healed from registry");
                healed
            }
            Err(e) => {
                tracing::warn!(did = %record.did, error = %e, "could not heal local status");
                record
            }
        }
    }

    /// Verification without a hash check.
    pub async fn status(&self, did: &str) -> Result<VerificationResponse, ServiceError> {
        self.verify(did, None).await
    }

    pub async fn get_by_user_id(&self, user_id: &UserId) -> Result<DidRecord, ServiceError> {
        Ok(self.identities.get_by_user_id(user_id).await?)
    }

    pub async fn get_by_did(&self, did: &str) -> Result<DidRecord, ServiceError> {
        Ok(self.identities.get_by_did(did).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<BlockchainJob, ServiceError> {
        Ok(self.jobs.get_by_id(id).await?)
    }

    /// Schedule a registry update for an active DID.
    pub async fn request_update(&self, did: &str) -> Result<BlockchainJob, ServiceError> {
        let record = self.active_record(did).await?;
        self.enqueue(JobType::Update, &record).await
    }

    /// Schedule revocation of an active DID. The local record turns
    /// `revoked` once the registry confirms.
    pub async fn revoke(&self, did: &str) -> Result<BlockchainJob, ServiceError> {
        let record = self.active_record(did).await?;
        let outstanding = self
            .jobs
            .list_by_did_ref(&record.id)
            .await?
            .into_iter()
            .any(|j| {
                j.job_type == JobType::Revoke
                    && j.status != JobStatus::Completed
                    && !j.is_dead_letter()
            });
        if outstanding {
            return Err(ServiceError::Conflict(format!(
                "revocation of {} already scheduled",
                did
            )));
        }
        self.enqueue(JobType::Revoke, &record).await
    }

    async fn active_record(&self, did: &str) -> Result<DidRecord, ServiceError> {
        let record = self.identities.get_by_did(did).await?;
        if record.status != DidStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "DID {} is {}, expected active",
                did, record.status
            )));
        }
        Ok(record)
    }

    async fn enqueue(
        &self,
        job_type: JobType,
        record: &DidRecord,
    ) -> Result<BlockchainJob, ServiceError> {
        let job = BlockchainJob::new(job_type, record, self.max_retries);
        self.jobs.create(&job).await?;
        tracing::info!(job_id = %job.id, job_type = %job_type, did = %record.did, "job enqueued");
        self.publish(&job).await;
        Ok(job)
    }

    /// Publishing is a wake-up; the poller finds the job regardless.
    async fn publish(&self, job: &BlockchainJob) {
        if let Err(e) = self.queue.publish(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "publish failed; job left for the poller");
        }
    }

    /// Jobs that ended without success.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<BlockchainJob>, ServiceError> {
        Ok(self.jobs.list_dead_letters(limit).await?)
    }

    /// Give a dead-lettered job a fresh retry budget. A failed identity
    /// behind a registration job goes back to `pending`.
    pub async fn requeue_dead_letter(&self, id: &JobId) -> Result<BlockchainJob, ServiceError> {
        let job = self.jobs.requeue(id).await?;

        if job.job_type == JobType::Register {
            let record = self.identities.get_by_id(&job.did_ref).await?;
            if record.status == DidStatus::Failed {
                let next = DidStateMachine::transition(record.status, DidEvent::Requeue)
                    .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
                self.identities.update_status(&record.id, next, None).await?;
            }
        }

        tracing::info!(job_id = %job.id, did = %job.did, "dead letter requeued");
        self.publish(&job).await;
        Ok(job)
    }

    pub async fn registry_stats(&self) -> Result<RegistryStats, ServiceError> {
        Ok(self.ledger.stats().await?)
    }
}
