use std::sync::Arc;

use anchor_queue::{HandlerError, JobHandler, JobMessage};
use async_trait::async_trait;

use crate::error::ServiceError;
use crate::worker::ReconciliationWorker;

/// Feeds queue deliveries into the worker.
///
/// A message is acknowledged once the job reached any outcome, including
/// `Skipped` when another driver holds it. Only local storage failures are
/// negatively acknowledged so the delivery is tried again.
pub struct QueueJobHandler {
    worker: Arc<ReconciliationWorker>,
}

impl QueueJobHandler {
    pub fn new(worker: Arc<ReconciliationWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobHandler for QueueJobHandler {
    async fn handle(&self, message: &JobMessage) -> Result<(), HandlerError> {
        match self.worker.process_job(&message.job_id).await {
            Ok(outcome) => {
                tracing::debug!(job_id = %message.job_id, ?outcome, "delivery handled");
                Ok(())
            }
            Err(ServiceError::NotFound(what)) => {
                tracing::warn!(job_id = %message.job_id, %what, "delivery for unknown job dropped");
                Ok(())
            }
            Err(e) => Err(HandlerError(e.to_string())),
        }
    }
}
