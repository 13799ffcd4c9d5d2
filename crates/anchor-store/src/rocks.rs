//! RocksDB backend for the Identity Store and the Job Ledger.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anchor_core::{BlockchainJob, DidId, DidRecord, DidStatus, JobId, JobStatus, UserId};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::traits::{IdentityStore, JobLedger};
use crate::transitions;

/// Column family names for different data types.
const CF_IDENTITIES: &str = "identities";
const CF_DID_INDEX: &str = "did_index";
const CF_HASH_INDEX: &str = "hash_index";
const CF_USER_INDEX: &str = "user_index";
const CF_JOBS: &str = "jobs";
/// Eligible jobs keyed by creation time, so FIFO reads are a prefix scan.
const CF_JOB_QUEUE: &str = "job_queue";

/// RocksDB-backed storage.
///
/// Reads go straight to the database. Every read-modify-write runs under a
/// single write mutex and lands as one `WriteBatch`, so a record and its
/// indexes never diverge and `claim` cannot be won twice. RocksDB's own lock
/// file keeps a second process from opening the same directory.
pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Internal(format!("create {}: {}", path.display(), e)))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = [
            CF_IDENTITIES,
            CF_DID_INDEX,
            CF_HASH_INDEX,
            CF_USER_INDEX,
            CF_JOBS,
            CF_JOB_QUEUE,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        tracing::info!(path = %path.display(), "opened identity store");

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Internal(format!("column family '{}' not found", name)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Internal("write lock poisoned".into()))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    // ── identities ──

    fn index_lookup(&self, cf: &str, key: &[u8], what: &str) -> Result<DidRecord, StoreError> {
        let id = self
            .db
            .get_cf(self.cf(cf)?, key)?
            .ok_or_else(|| StoreError::NotFound(what.to_string()))?;
        self.get_json(CF_IDENTITIES, &id)?
            .ok_or_else(|| StoreError::NotFound(what.to_string()))
    }

    fn load_identity(&self, id: &DidId) -> Result<DidRecord, StoreError> {
        self.get_json(CF_IDENTITIES, id.to_string().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", id)))
    }

    fn save_identity(&self, record: &DidRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.put_json(
            &mut batch,
            CF_IDENTITIES,
            record.id.to_string().as_bytes(),
            record,
        )?;
        self.db.write(batch)?;
        Ok(())
    }

    // ── jobs ──

    fn queue_key(job: &BlockchainJob) -> Vec<u8> {
        let nanos = job
            .created_at
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .max(0);
        format!("{:020}{}", nanos, job.id).into_bytes()
    }

    fn load_job(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        self.get_json(CF_JOBS, id.to_string().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))
    }

    /// Stage the job row and keep its eligibility index entry in step.
    fn stage_job(&self, batch: &mut WriteBatch, job: &BlockchainJob) -> Result<(), StoreError> {
        let id = job.id.to_string();
        self.put_json(batch, CF_JOBS, id.as_bytes(), job)?;
        let queue = self.cf(CF_JOB_QUEUE)?;
        if job.is_eligible() {
            batch.put_cf(queue, Self::queue_key(job), id.as_bytes());
        } else {
            batch.delete_cf(queue, Self::queue_key(job));
        }
        Ok(())
    }

    /// Load, edit and write back one job under the write lock.
    fn mutate_job<T>(
        &self,
        id: &JobId,
        edit: impl FnOnce(&mut BlockchainJob) -> Result<T, StoreError>,
    ) -> Result<(T, BlockchainJob), StoreError> {
        let _guard = self.lock()?;
        let mut job = self.load_job(id)?;
        let out = edit(&mut job)?;
        let mut batch = WriteBatch::default();
        self.stage_job(&mut batch, &job)?;
        self.db.write(batch)?;
        Ok((out, job))
    }

    fn scan_jobs(&self, keep: impl Fn(&BlockchainJob) -> bool) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs: Vec<BlockchainJob> = self.scan(CF_JOBS)?;
        jobs.retain(|j| keep(j));
        transitions::sort_fifo(&mut jobs);
        Ok(jobs)
    }
}

#[async_trait]
impl IdentityStore for RocksStore {
    async fn create(&self, record: &DidRecord) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let id = record.id.to_string();

        if self.db.get_cf(self.cf(CF_IDENTITIES)?, id.as_bytes())?.is_some() {
            return Err(StoreError::Conflict(format!("identity {} exists", record.id)));
        }
        if self.db.get_cf(self.cf(CF_DID_INDEX)?, record.did.as_bytes())?.is_some() {
            return Err(StoreError::Conflict(format!("DID {} exists", record.did)));
        }
        if self
            .db
            .get_cf(self.cf(CF_HASH_INDEX)?, record.user_hash.as_bytes())?
            .is_some()
        {
            return Err(StoreError::Conflict("user hash exists".into()));
        }

        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_IDENTITIES, id.as_bytes(), record)?;
        batch.put_cf(self.cf(CF_DID_INDEX)?, record.did.as_bytes(), id.as_bytes());
        batch.put_cf(self.cf(CF_HASH_INDEX)?, record.user_hash.as_bytes(), id.as_bytes());
        batch.put_cf(
            self.cf(CF_USER_INDEX)?,
            record.user_id.to_string().as_bytes(),
            id.as_bytes(),
        );
        self.db.write(batch)?;

        tracing::debug!(did = %record.did, id = %record.id, "identity created");
        Ok(())
    }

    async fn get_by_id(&self, id: &DidId) -> Result<DidRecord, StoreError> {
        self.load_identity(id)
    }

    async fn get_by_did(&self, did: &str) -> Result<DidRecord, StoreError> {
        self.index_lookup(CF_DID_INDEX, did.as_bytes(), &format!("DID {}", did))
    }

    async fn get_by_user_id(&self, user_id: &UserId) -> Result<DidRecord, StoreError> {
        self.index_lookup(
            CF_USER_INDEX,
            user_id.to_string().as_bytes(),
            &format!("identity for user {}", user_id),
        )
    }

    async fn get_by_user_hash(&self, user_hash: &str) -> Result<DidRecord, StoreError> {
        self.index_lookup(CF_HASH_INDEX, user_hash.as_bytes(), "identity for user hash")
    }

    async fn update(&self, record: &DidRecord) -> Result<DidRecord, StoreError> {
        let _guard = self.lock()?;
        let current = self.load_identity(&record.id)?;
        if current.did != record.did
            || current.user_hash != record.user_hash
            || current.user_id != record.user_id
        {
            return Err(StoreError::Conflict(format!(
                "identity {}: DID, user hash and owner are immutable",
                record.id
            )));
        }
        let mut updated = record.clone();
        updated.created_at = current.created_at;
        updated.updated_at = Utc::now();
        self.save_identity(&updated)?;
        Ok(updated)
    }

    async fn update_status(
        &self,
        id: &DidId,
        status: DidStatus,
        chain_tx: Option<&str>,
    ) -> Result<DidRecord, StoreError> {
        let _guard = self.lock()?;
        let mut record = self.load_identity(id)?;
        record.status = status;
        if let Some(tx) = chain_tx {
            record.chain_tx = Some(tx.to_string());
        }
        record.updated_at = Utc::now();
        self.save_identity(&record)?;
        Ok(record)
    }

    async fn list_by_status(&self, status: DidStatus) -> Result<Vec<DidRecord>, StoreError> {
        let mut records: Vec<DidRecord> = self.scan(CF_IDENTITIES)?;
        records.retain(|r| r.status == status);
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[async_trait]
impl JobLedger for RocksStore {
    async fn create(&self, job: &BlockchainJob) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if self
            .db
            .get_cf(self.cf(CF_JOBS)?, job.id.to_string().as_bytes())?
            .is_some()
        {
            return Err(StoreError::Conflict(format!("job {} exists", job.id)));
        }
        let mut batch = WriteBatch::default();
        self.stage_job(&mut batch, job)?;
        self.db.write(batch)?;
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job created");
        Ok(())
    }

    async fn get_by_id(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        self.load_job(id)
    }

    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_JOB_QUEUE)?, IteratorMode::Start) {
            if jobs.len() >= limit {
                break;
            }
            let (_, id) = item?;
            let Some(job) = self.get_json::<BlockchainJob>(CF_JOBS, &id)? else {
                continue;
            };
            if job.is_eligible() {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<BlockchainJob, StoreError> {
        let ((), job) = self.mutate_job(id, |job| {
            transitions::set_status(job, status, error);
            Ok(())
        })?;
        Ok(job)
    }

    async fn mark_completed(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        let ((), job) = self.mutate_job(id, transitions::complete)?;
        Ok(job)
    }

    async fn increment_retry_count(
        &self,
        id: &JobId,
        error: &str,
    ) -> Result<BlockchainJob, StoreError> {
        let ((), job) = self.mutate_job(id, |job| transitions::retry(job, error))?;
        Ok(job)
    }

    async fn cleanup_completed(&self, older_than_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let _guard = self.lock()?;
        let expired = self.scan_jobs(|j| {
            j.status == JobStatus::Completed && j.processed_at.is_some_and(|t| t < cutoff)
        })?;
        if expired.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        let jobs = self.cf(CF_JOBS)?;
        let queue = self.cf(CF_JOB_QUEUE)?;
        for job in &expired {
            batch.delete_cf(jobs, job.id.to_string().as_bytes());
            batch.delete_cf(queue, Self::queue_key(job));
        }
        self.db.write(batch)?;
        Ok(expired.len())
    }

    async fn claim(&self, id: &JobId) -> Result<Option<BlockchainJob>, StoreError> {
        let (won, job) = self.mutate_job(id, |job| Ok(transitions::claim(job)))?;
        Ok(won.then_some(job))
    }

    async fn renew_claim(&self, id: &JobId) -> Result<bool, StoreError> {
        let (held, _) = self.mutate_job(id, |job| Ok(transitions::renew(job)))?;
        Ok(held)
    }

    async fn record_tx_ref(&self, id: &JobId, tx_ref: &str) -> Result<(), StoreError> {
        self.mutate_job(id, |job| {
            job.last_tx_ref = Some(tx_ref.to_string());
            job.updated_at = Utc::now();
            Ok(())
        })?;
        Ok(())
    }

    async fn list_by_did_ref(&self, did_ref: &DidId) -> Result<Vec<BlockchainJob>, StoreError> {
        self.scan_jobs(|j| j.did_ref == *did_ref)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<BlockchainJob>, StoreError> {
        let mut jobs = self.scan_jobs(BlockchainJob::is_dead_letter)?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn requeue(&self, id: &JobId) -> Result<BlockchainJob, StoreError> {
        let ((), job) = self.mutate_job(id, transitions::requeue)?;
        Ok(job)
    }

    async fn release_stale_claims(
        &self,
        lease: chrono::Duration,
    ) -> Result<Vec<BlockchainJob>, StoreError> {
        let cutoff = Utc::now() - lease;
        let _guard = self.lock()?;
        let mut released = Vec::new();
        let mut batch = WriteBatch::default();
        for mut job in self.scan_jobs(|j| j.status == JobStatus::Processing)? {
            if transitions::expire_lease(&mut job, cutoff) {
                self.stage_job(&mut batch, &job)?;
                released.push(job);
            }
        }
        if !released.is_empty() {
            self.db.write(batch)?;
        }
        Ok(released)
    }
}
