//! Job mutations shared by every backend. Each function edits the job in
//! place and bumps `updated_at`; the backend decides how to persist it.

use anchor_core::{BlockchainJob, JobEvent, JobStateMachine, JobStatus};
use chrono::{DateTime, Utc};

use crate::error::StoreError;

pub(crate) const LEASE_EXPIRED_ERROR: &str = "claim lease expired";

/// Compare-and-swap claim. Leaves the job untouched and returns `false` if it
/// is not eligible.
pub(crate) fn claim(job: &mut BlockchainJob) -> bool {
    if !job.is_eligible() {
        return false;
    }
    match JobStateMachine::transition(job.status, JobEvent::Claim) {
        Ok(next) => {
            job.status = next;
            job.updated_at = Utc::now();
            true
        }
        Err(_) => false,
    }
}

/// Bump the lease on a live claim.
pub(crate) fn renew(job: &mut BlockchainJob) -> bool {
    if job.status != JobStatus::Processing {
        return false;
    }
    job.updated_at = Utc::now();
    true
}

pub(crate) fn complete(job: &mut BlockchainJob) -> Result<(), StoreError> {
    job.status = JobStateMachine::transition(job.status, JobEvent::Complete)?;
    let now = Utc::now();
    job.error = None;
    job.processed_at = Some(now);
    job.updated_at = now;
    Ok(())
}

pub(crate) fn retry(job: &mut BlockchainJob, error: &str) -> Result<(), StoreError> {
    if job.status == JobStatus::Completed {
        return Err(StoreError::Conflict(format!(
            "job {} already completed",
            job.id
        )));
    }
    job.status = JobStatus::Retrying;
    job.retry_count = job.retry_count.saturating_add(1);
    job.error = Some(error.to_string());
    job.updated_at = Utc::now();
    Ok(())
}

pub(crate) fn set_status(job: &mut BlockchainJob, status: JobStatus, error: Option<&str>) {
    job.status = status;
    if let Some(e) = error {
        job.error = Some(e.to_string());
    }
    let now = Utc::now();
    if matches!(status, JobStatus::Completed | JobStatus::Failed) {
        job.processed_at = Some(now);
    }
    job.updated_at = now;
}

pub(crate) fn requeue(job: &mut BlockchainJob) -> Result<(), StoreError> {
    if !job.is_dead_letter() {
        return Err(StoreError::Conflict(format!(
            "job {} is {} and not dead-lettered",
            job.id, job.status
        )));
    }
    job.status = JobStateMachine::transition(job.status, JobEvent::Requeue)?;
    job.retry_count = 0;
    job.error = None;
    job.processed_at = None;
    job.updated_at = Utc::now();
    Ok(())
}

/// Release a claim that has outlived `cutoff`. Returns `false` when the job
/// is not a stale claim.
pub(crate) fn expire_lease(job: &mut BlockchainJob, cutoff: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Processing || job.updated_at >= cutoff {
        return false;
    }
    match JobStateMachine::transition(job.status, JobEvent::LeaseExpired) {
        Ok(next) => {
            job.status = next;
            job.retry_count = job.retry_count.saturating_add(1);
            job.error = Some(LEASE_EXPIRED_ERROR.to_string());
            job.updated_at = Utc::now();
            true
        }
        Err(_) => false,
    }
}

/// Oldest first, id as tie-breaker.
pub(crate) fn sort_fifo(jobs: &mut [BlockchainJob]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
