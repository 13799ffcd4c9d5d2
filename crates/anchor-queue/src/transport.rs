use std::sync::Arc;

use anchor_core::{BlockchainJob, JobType};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{HandlerError, QueueError};
use crate::message::JobMessage;

/// Processes one delivered message.
///
/// `Ok` acknowledges the message. `Err` negatively acknowledges it and it is
/// redelivered until the consumer's delivery limit.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, message: &JobMessage) -> Result<(), HandlerError>;
}

/// Durable at-least-once publish/subscribe for Blockchain Jobs.
///
/// The same message can be delivered more than once; handlers must be
/// idempotent or claim the job before acting on it.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, job: &BlockchainJob) -> Result<(), QueueError>;

    /// Attach a handler to the durable consumer for `job_type`. Delivery runs
    /// until the returned [`Subscription`] is dropped.
    async fn subscribe(
        &self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Subscription, QueueError>;
}

/// Handle to a running consumer. Dropping it stops delivery; messages that
/// were not acknowledged stay in the log.
pub struct Subscription {
    consumer: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(consumer: String, handle: JoinHandle<()>) -> Self {
        Self { consumer, handle }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn shutdown(self) {
        tracing::info!(consumer = %self.consumer, "consumer stopped");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
