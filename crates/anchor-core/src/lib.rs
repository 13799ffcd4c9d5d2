//! Anchor Core: data model, errors and lifecycle state machines for
//! DID issuance and blockchain anchoring.

pub mod did_state;
pub mod error;
pub mod job_state;
pub mod types;

pub use did_state::{DidEvent, DidStateMachine, DidStatus};
pub use error::CoreError;
pub use job_state::{JobEvent, JobStateMachine, JobStatus};
pub use types::{
    validate_did, BlockchainJob, DidId, DidRecord, JobId, JobType, UserId, DEFAULT_MAX_RETRIES,
    DID_PREFIX, DID_SEGMENT_LEN,
};
