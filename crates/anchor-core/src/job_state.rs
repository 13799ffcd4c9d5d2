use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The states of a Blockchain Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting for a driver to claim it.
    Pending,
    /// Claimed by exactly one driver.
    Processing,
    /// Chain operation confirmed. Final state.
    Completed,
    /// Unrecoverable error or retry budget exhausted.
    Failed,
    /// A recoverable error occurred; eligible again while retries remain.
    Retrying,
}

impl JobStatus {
    /// Whether a job in this state may be claimed (retry budget permitting).
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(CoreError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// Events that move a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A driver takes exclusive ownership of the job.
    Claim,
    /// The chain operation was confirmed.
    Complete,
    /// A recoverable failure; the job goes back for another attempt.
    RecoverableFailure,
    /// An unrecoverable failure, or the retry budget ran out.
    Fail,
    /// The claim outlived its lease (driver crashed mid-attempt).
    LeaseExpired,
    /// An operator put a dead-lettered job back in the queue.
    Requeue,
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Validates job transitions.
///
/// Valid transitions:
/// - Pending | Retrying → Processing (Claim)
/// - Processing → Completed (Complete)
/// - Processing → Retrying (RecoverableFailure, LeaseExpired)
/// - Processing | Retrying → Failed (Fail)
/// - Failed | Retrying → Pending (Requeue)
pub struct JobStateMachine;

impl JobStateMachine {
    pub fn transition(current: JobStatus, event: JobEvent) -> Result<JobStatus, CoreError> {
        let next = match (current, event) {
            (JobStatus::Pending | JobStatus::Retrying, JobEvent::Claim) => JobStatus::Processing,
            (JobStatus::Processing, JobEvent::Complete) => JobStatus::Completed,
            (JobStatus::Processing, JobEvent::RecoverableFailure) => JobStatus::Retrying,
            (JobStatus::Processing, JobEvent::LeaseExpired) => JobStatus::Retrying,
            // Retrying → Failed covers a retry that exhausted the budget.
            (JobStatus::Processing | JobStatus::Retrying, JobEvent::Fail) => JobStatus::Failed,
            (JobStatus::Failed | JobStatus::Retrying, JobEvent::Requeue) => JobStatus::Pending,
            _ => {
                return Err(CoreError::InvalidJobTransition {
                    from: current.to_string(),
                    event: event.to_string(),
                })
            }
        };

        tracing::trace!(from = %current, to = %next, event = ?event, "job state transition");

        Ok(next)
    }

    pub fn can_transition(current: JobStatus, event: JobEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
