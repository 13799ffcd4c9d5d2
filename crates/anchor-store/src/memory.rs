use std::sync::Mutex;

use anchor_core::{BlockchainJob, DidId, DidRecord, DidStatus, JobId, JobStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::traits::{IdentityStore, JobLedger};
use crate::transitions;

/// In-memory backend for both stores.
///
/// Per-job mutations run under the DashMap shard write lock, so `claim` is a
/// true compare-and-swap. Identity creation takes a short mutex so the three
/// uniqueness indexes are checked and filled together.
pub struct MemoryStore {
    identities: DashMap<DidId, DidRecord>,
    did_index: DashMap<String, DidId>,
    hash_index: DashMap<String, DidId>,
    user_index: DashMap<UserId, DidId>,
    jobs: DashMap<JobId, BlockchainJob>,
    create_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            identities: DashMap::new(),
            did_index: DashMap::new(),
            hash_index: DashMap::new(),
            user_index: DashMap::new(),
            jobs: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    fn lookup(&self, id: Option<DidId>, what: &str) -> Result<DidRecord, StoreError> {
        id.and_then(|id| self.identities.get(&id).map(|r| r.clone()))
            .ok_or_else(|| StoreError::NotFound(what.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn completed_before(job: &BlockchainJob, cutoff: DateTime<Utc>) -> bool {
    job.status == JobStatus::Completed && job.processed_at.is_some_and(|t| t < cutoff)
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn create(&self, record: &DidRecord) -> Result<(), StoreError> {
        let _guard = self
            .create_lock
            .lock()
            .map_err(|_| StoreError::Internal("identity create lock poisoned".into()))?;

        if self.identities.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("identity {} exists", record.id)));
        }
        if self.did_index.contains_key(&record.did) {
            return Err(StoreError::Conflict(format!("DID {} exists", record.did)));
        }
        if self.hash_index.contains_key(&record.user_hash) {
            return Err(StoreError::Conflict("user hash exists".into()));
        }

        self.did_index.insert(record.did.clone(), record.id);
        self.hash_index.insert(record.user_hash.clone(), record.id);
        self.user_index.insert(record.user_id, record.id);
        self.identities.insert(record.id, record.clone());

        tracing::debug!(did = %record.did, id = %record.id, "identity created");
        Ok(())
    }

    async fn get_by_id(&self, id: &DidId) -> Result<DidRecord, StoreError> {
        self.lookup(Some(*id), &format!("identity {}", id))
    }

    async fn get_by_did(&self, did: &str) -> Result<DidRecord, StoreError> {
        let id = self.did_index.get(did).map(|e| *e.value());
        self.lookup(id, &format!("DID {}", did))
    }

    async fn get_by_user_id(&self, user_id: &UserId) -> Result<DidRecord, StoreError> {
        let id = self.user_index.get(user_id).map(|e| *e.value());
        self.lookup(id, &format!("identity for user {}", user_id))
    }

    async fn get_by_user_hash(&self, user_hash: &str) -> Result<DidRecord, StoreError> {
        let id = self.hash_index.get(user_hash).map(|e| *e.value());
        self.lookup(id, "identity for user hash")
    }

    async fn update(&self, record: &DidRecord) -> Result<DidRecord, StoreError> {
        let mut entry = self
            .identities
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", record.id)))?;
        if entry.did != record.did
            || entry.user_hash != record.user_hash
            || entry.user_id != record.user_id
        {
            return Err(StoreError::Conflict(format!(
                "identity {}: DID, user hash and owner are immutable",
                record.id
            )));
        }
        let mut updated = record.clone();
        updated.created_at = entry.created_at;
        updated.updated_at = Utc::now();
        *entry = updated.clone();
        Ok(updated)
    }

    async fn update_status(
        &self,
        id: &DidId,
        status: DidStatus,
        chain_tx: Option<&str>,
    ) -> Result<DidRecord, StoreError> {
        let mut entry = self
            .identities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", id)))?;
        entry.status = status;
        if let Some(tx) = chain_tx {
            entry.chain_tx = Some(tx.to_string());
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list_by_status(&self, status: DidStatus) -> Result<Vec<DidRecord>, StoreError> {
        let mut records: Vec<DidRecord> = self
            .identities
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[async_trait]
impl JobLedger for MemoryStore {
    async fn create(&self, job: &BlockchainJob) -> Result<(), StoreError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("job {} exists", job.id))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job created");
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        self.jobs
            .get(id)
            .map(|j| j.clone())
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))
    }

    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs: Vec<BlockchainJob> = self
            .jobs
            .iter()
            .filter(|j| j.is_eligible())
            .map(|j| j.clone())
            .collect();
        transitions::sort_fifo(&mut jobs);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<BlockchainJob, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        transitions::set_status(&mut entry, status, error);
        Ok(entry.clone())
    }

    async fn mark_completed(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        transitions::complete(&mut entry)?;
        Ok(entry.clone())
    }

    async fn increment_retry_count(
        &self,
        id: &JobId,
        error: &str,
    ) -> Result<BlockchainJob, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        transitions::retry(&mut entry, error)?;
        Ok(entry.clone())
    }

    async fn cleanup_completed(&self, older_than_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| completed_before(j, cutoff))
            .map(|j| j.id)
            .collect();
        let removed = expired
            .iter()
            .filter(|id| {
                self.jobs
                    .remove_if(*id, |_, j| completed_before(j, cutoff))
                    .is_some()
            })
            .count();
        Ok(removed)
    }

    async fn claim(&self, id: &JobId) -> Result<Option<BlockchainJob>, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        if transitions::claim(&mut entry) {
            Ok(Some(entry.clone()))
        } else {
            Ok(None)
        }
    }

    async fn renew_claim(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        Ok(transitions::renew(&mut entry))
    }

    async fn record_tx_ref(&self, id: &JobId, tx_ref: &str) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        entry.last_tx_ref = Some(tx_ref.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_did_ref(&self, did_ref: &DidId) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs: Vec<BlockchainJob> = self
            .jobs
            .iter()
            .filter(|j| j.did_ref == *did_ref)
            .map(|j| j.clone())
            .collect();
        transitions::sort_fifo(&mut jobs);
        Ok(jobs)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs: Vec<BlockchainJob> = self
            .jobs
            .iter()
            .filter(|j| j.is_dead_letter())
            .map(|j| j.clone())
            .collect();
        transitions::sort_fifo(&mut jobs);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn requeue(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        transitions::requeue(&mut entry)?;
        Ok(entry.clone())
    }

    async fn release_stale_claims(
        &self,
        lease: chrono::Duration,
    ) -> Result<Vec<BlockchainJob>, StoreError> {
        let cutoff = Utc::now() - lease;
        let mut released = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if transitions::expire_lease(&mut entry, cutoff) {
                released.push(entry.clone());
            }
        }
        transitions::sort_fifo(&mut released);
        Ok(released)
    }
}
