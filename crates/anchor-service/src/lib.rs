//! Identity Service facade and the Reconciliation Worker that drives
//! Blockchain Jobs to completion.

pub mod config;
pub mod error;
pub mod handler;
pub mod service;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use error::ServiceError;
pub use handler::QueueJobHandler;
pub use service::{CreatedIdentity, IdentityService, VerificationReason, VerificationResponse};
pub use worker::{PollReport, ProcessOutcome, ReconciliationWorker};
