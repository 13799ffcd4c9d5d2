use anchor_core::{BlockchainJob, DidId, JobId, JobType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subjects are `blockchain.jobs.<job type>`.
pub const SUBJECT_PREFIX: &str = "blockchain.jobs";

pub fn subject_for(job_type: JobType) -> String {
    format!("{}.{}", SUBJECT_PREFIX, job_type)
}

/// The payload published for a job. Carries enough to find the job row; the
/// row itself stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub job_type: JobType,
    pub did_ref: DidId,
    pub user_hash: String,
    pub did: String,
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn from_job(job: &BlockchainJob) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            did_ref: job.did_ref,
            user_hash: job.user_hash.clone(),
            did: job.did.clone(),
            created_at: job.created_at,
        }
    }

    pub fn subject(&self) -> String {
        subject_for(self.job_type)
    }
}
