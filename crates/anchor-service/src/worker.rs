//! Reconciliation Worker.
//!
//! Drives Blockchain Jobs to a terminal state. Work arrives two ways: queue
//! deliveries through [`QueueJobHandler`](crate::QueueJobHandler) and a
//! periodic scan of the Job Ledger. Both end in [`ReconciliationWorker::process_job`],
//! and the ledger claim makes sure only one of them acts on a given job.

use std::sync::Arc;
use std::time::Duration;

use anchor_core::{
    BlockchainJob, DidEvent, DidId, DidStateMachine, DidStatus, JobId, JobStatus, JobType,
};
use anchor_ledger::{LedgerClient, LedgerError, TxStatus};
use anchor_queue::{QueueTransport, Subscription};
use anchor_store::{IdentityStore, JobLedger};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::WorkerConfig;
use crate::error::ServiceError;
use crate::handler::QueueJobHandler;

/// What one [`ReconciliationWorker::process_job`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The registry reflects the job. `tx_ref` is `None` when the registry
    /// already held the result and no transaction of ours is known.
    Completed { tx_ref: Option<String> },
    /// Another driver holds the job, or it is not eligible.
    Skipped,
    Retrying { retry_count: u32, error: String },
    Failed { error: String },
}

/// Counters from one [`ReconciliationWorker::poll_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub released: usize,
    pub orphans: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ReconciliationWorker {
    identities: Arc<dyn IdentityStore>,
    jobs: Arc<dyn JobLedger>,
    queue: Arc<dyn QueueTransport>,
    ledger: LedgerClient,
    config: WorkerConfig,
}

fn chrono_duration(d: std::time::Duration) -> Result<chrono::Duration, ServiceError> {
    chrono::Duration::from_std(d).map_err(|e| ServiceError::InvalidInput(e.to_string()))
}

impl ReconciliationWorker {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        jobs: Arc<dyn JobLedger>,
        queue: Arc<dyn QueueTransport>,
        ledger: LedgerClient,
        config: WorkerConfig,
    ) -> Self {
        Self {
            identities,
            jobs,
            queue,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim and execute one job.
    ///
    /// Returns `Err` only when local state could not be read or written; the
    /// job is then left for the claim lease to release.
    pub async fn process_job(&self, id: &JobId) -> Result<ProcessOutcome, ServiceError> {
        let Some(job) = self.jobs.claim(id).await? else {
            tracing::debug!(job_id = %id, "job not claimable, skipping");
            return Ok(ProcessOutcome::Skipped);
        };
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            did = %job.did,
            attempt = job.retry_count + 1,
            "processing job"
        );

        let result = self.execute_holding_claim(&job).await;

        if !self.jobs.renew_claim(&job.id).await? {
            // Released while in flight; the current holder owns the outcome.
            let tx_ref = match &result {
                Ok(tx_ref) => tx_ref.as_deref(),
                Err(e) => e.tx_ref(),
            };
            if let Some(tx) = tx_ref {
                self.jobs.record_tx_ref(&job.id, tx).await?;
            }
            tracing::warn!(job_id = %job.id, did = %job.did, "claim lost during processing, outcome discarded");
            return Ok(ProcessOutcome::Skipped);
        }

        match result {
            Ok(tx_ref) => self.complete(&job, tx_ref).await,
            Err(e) => self.fail(&job, e).await,
        }
    }

    /// Run [`Self::execute`] while renewing the claim, so time spent queued
    /// behind other submissions is not mistaken for an abandoned job.
    async fn execute_holding_claim(
        &self,
        job: &BlockchainJob,
    ) -> Result<Option<String>, LedgerError> {
        let work = self.execute(job);
        tokio::pin!(work);

        let mut renew = tokio::time::interval(self.renew_interval());
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renew.tick() => {
                    match self.jobs.renew_claim(&job.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(job_id = %job.id, "claim no longer held");
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %e, "claim renewal failed");
                        }
                    }
                }
            }
        }
    }

    fn renew_interval(&self) -> Duration {
        (self.config.claim_lease / 3).max(Duration::from_millis(10))
    }

    /// Make the registry reflect `job`, without resubmitting work that an
    /// earlier attempt already got on chain.
    async fn execute(&self, job: &BlockchainJob) -> Result<Option<String>, LedgerError> {
        if let Some(previous) = &job.last_tx_ref {
            match self.ledger.transaction_status(previous).await? {
                TxStatus::Confirmed { block_number } => {
                    tracing::info!(job_id = %job.id, tx_ref = %previous, block_number, "earlier attempt confirmed");
                    return Ok(Some(previous.clone()));
                }
                TxStatus::Reverted { reason } => {
                    tracing::debug!(job_id = %job.id, tx_ref = %previous, %reason, "earlier attempt reverted");
                }
                TxStatus::Unknown => {}
            }
        }

        if job.retry_count > 0 || job.last_tx_ref.is_some() {
            let entry = self.ledger.lookup(&job.did).await?;
            let already = match job.job_type {
                JobType::Register => entry.is_valid,
                JobType::Revoke => !entry.is_valid && entry.user_hash.is_some(),
                JobType::Update => false,
            };
            if already {
                tracing::info!(job_id = %job.id, did = %job.did, "registry already reflects job");
                return Ok(job.last_tx_ref.clone());
            }
        }

        let tx_ref = match job.job_type {
            JobType::Register => self.ledger.register_did(&job.user_hash, &job.did).await?,
            JobType::Update => self.ledger.update_did(&job.user_hash, &job.did).await?,
            JobType::Revoke => self.ledger.revoke_did(&job.user_hash).await?,
        };
        Ok(Some(tx_ref))
    }

    async fn complete(
        &self,
        job: &BlockchainJob,
        tx_ref: Option<String>,
    ) -> Result<ProcessOutcome, ServiceError> {
        if let Some(tx) = &tx_ref {
            self.jobs.record_tx_ref(&job.id, tx).await?;
        }
        let event = match job.job_type {
            JobType::Register | JobType::Update => DidEvent::Confirm,
            JobType::Revoke => DidEvent::Revoke,
        };
        self.apply_identity_event(&job.did_ref, event, tx_ref.as_deref())
            .await?;
        self.jobs.mark_completed(&job.id).await?;

        tracing::info!(job_id = %job.id, job_type = %job.job_type, did = %job.did, "job completed");
        Ok(ProcessOutcome::Completed { tx_ref })
    }

    async fn fail(
        &self,
        job: &BlockchainJob,
        err: LedgerError,
    ) -> Result<ProcessOutcome, ServiceError> {
        if let Some(tx) = err.tx_ref() {
            self.jobs.record_tx_ref(&job.id, tx).await?;
        }
        let error = err.to_string();

        if err.is_recoverable() {
            let updated = self.jobs.increment_retry_count(&job.id, &error).await?;
            if !updated.is_exhausted() {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    max_retries = updated.max_retries,
                    error = %error,
                    "job will be retried"
                );
                return Ok(ProcessOutcome::Retrying {
                    retry_count: updated.retry_count,
                    error,
                });
            }
        }

        self.jobs
            .update_status(&job.id, JobStatus::Failed, Some(&error))
            .await?;
        self.on_terminal_failure(job).await?;
        tracing::error!(job_id = %job.id, job_type = %job.job_type, did = %job.did, error = %error, "job failed");
        Ok(ProcessOutcome::Failed { error })
    }

    /// Only a failed registration fails the identity; an active DID stays
    /// active when an update or revoke gives up.
    async fn on_terminal_failure(&self, job: &BlockchainJob) -> Result<(), ServiceError> {
        if job.job_type == JobType::Register {
            self.apply_identity_event(&job.did_ref, DidEvent::Fail, None)
                .await?;
        }
        Ok(())
    }

    async fn apply_identity_event(
        &self,
        did_ref: &DidId,
        event: DidEvent,
        chain_tx: Option<&str>,
    ) -> Result<(), ServiceError> {
        let record = self.identities.get_by_id(did_ref).await?;
        match DidStateMachine::transition(record.status, event) {
            Ok(next) => {
                self.identities
                    .update_status(did_ref, next, chain_tx)
                    .await?;
            }
            Err(e) => {
                tracing::warn!(did = %record.did, error = %e, "identity left unchanged");
            }
        }
        Ok(())
    }

    /// One scan: release abandoned claims, recover orphaned identities, then
    /// process a batch of eligible jobs oldest first.
    pub async fn poll_once(&self) -> Result<PollReport, ServiceError> {
        let mut report = PollReport::default();

        let released = self
            .jobs
            .release_stale_claims(chrono_duration(self.config.claim_lease)?)
            .await?;
        report.released = released.len();
        for job in released {
            tracing::warn!(job_id = %job.id, retry_count = job.retry_count, "stale claim released");
            if job.is_exhausted() {
                self.jobs
                    .update_status(&job.id, JobStatus::Failed, job.error.as_deref())
                    .await?;
                self.on_terminal_failure(&job).await?;
                report.failed += 1;
            }
        }

        report.orphans = self.sweep_orphans().await?;

        for job in self.jobs.get_pending_jobs(self.config.batch_size).await? {
            match self.process_job(&job.id).await {
                Ok(ProcessOutcome::Completed { .. }) => report.completed += 1,
                Ok(ProcessOutcome::Retrying { .. }) => report.retrying += 1,
                Ok(ProcessOutcome::Failed { .. }) => report.failed += 1,
                Ok(ProcessOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "job processing aborted");
                }
            }
        }

        Ok(report)
    }

    /// Pending identities past the grace period with no job at all get their
    /// registration job now.
    async fn sweep_orphans(&self) -> Result<usize, ServiceError> {
        let cutoff = Utc::now() - chrono_duration(self.config.orphan_grace)?;
        let mut created = 0;
        for record in self.identities.list_by_status(DidStatus::Pending).await? {
            if record.created_at > cutoff {
                continue;
            }
            if !self.jobs.list_by_did_ref(&record.id).await?.is_empty() {
                continue;
            }
            let job = BlockchainJob::new(JobType::Register, &record, self.config.max_retries);
            self.jobs.create(&job).await?;
            tracing::warn!(did = %record.did, job_id = %job.id, "orphaned identity recovered");
            if let Err(e) = self.queue.publish(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "publish failed; job left for the poller");
            }
            created += 1;
        }
        Ok(created)
    }

    /// Delete completed jobs past the retention window.
    pub async fn cleanup(&self) -> Result<usize, ServiceError> {
        let removed = self
            .jobs
            .cleanup_completed(self.config.completed_retention_days)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "completed jobs cleaned up");
        }
        Ok(removed)
    }

    /// Attach a queue consumer for every job type.
    pub async fn subscribe_all(self: &Arc<Self>) -> Result<Vec<Subscription>, ServiceError> {
        let handler = Arc::new(QueueJobHandler::new(self.clone()));
        let mut subscriptions = Vec::new();
        for job_type in JobType::all() {
            subscriptions.push(self.queue.subscribe(job_type, handler.clone()).await?);
        }
        Ok(subscriptions)
    }

    /// Poll and clean up on their intervals until `shutdown` turns true or
    /// its sender is dropped. The first poll runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retention = tokio::time::interval(self.config.retention_interval);
        retention.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report != PollReport::default() => {
                            tracing::debug!(?report, "poll finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "poll failed"),
                    }
                }
                _ = retention.tick() => {
                    if let Err(e) = self.cleanup().await {
                        tracing::error!(error = %e, "cleanup failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("reconciliation worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use anchor_core::UserId;

    async fn created(h: &Harness) -> (anchor_core::DidRecord, BlockchainJob) {
        let c = h
            .service
            .create(UserId::new(), "Ada", "ada@example.com")
            .await
            .unwrap();
        (c.record, c.job.unwrap())
    }

    #[tokio::test]
    async fn test_register_job_activates_identity() {
        let h = Harness::new();
        let (record, job) = created(&h).await;

        let outcome = h.worker.process_job(&job.id).await.unwrap();
        let ProcessOutcome::Completed { tx_ref: Some(tx_ref) } = outcome.clone() else {
            panic!("unexpected outcome {:?}", outcome);
        };

        let stored = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(stored.status, DidStatus::Active);
        assert_eq!(stored.chain_tx.as_deref(), Some(tx_ref.as_str()));
        let job = h.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processed_at.is_some());
        assert!(h.service.verify(&record.did, None).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_completed_job_is_skipped() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.worker.process_job(&job.id).await.unwrap();

        let outcome = h.worker.process_job(&job.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(h.chain.submissions_for("register", &record.did), 1);
    }

    #[tokio::test]
    async fn test_chain_outage_retries_then_recovers() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.chain.set_offline(true);

        let outcome = h.worker.process_job(&job.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));
        let stored = h.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert!(stored.error.is_some());

        h.chain.set_offline(false);
        let report = h.worker.poll_once().await.unwrap();
        assert_eq!(report.completed, 1);
        let stored = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(stored.status, DidStatus::Active);
    }

    #[tokio::test]
    async fn test_exhausted_register_fails_identity() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.chain.set_offline(true);

        let mut last = ProcessOutcome::Skipped;
        for _ in 0..job.max_retries {
            last = h.worker.process_job(&job.id).await.unwrap();
        }
        assert!(matches!(last, ProcessOutcome::Failed { .. }));

        let stored = h.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.is_dead_letter());
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Failed);

        // Nothing further happens to a dead letter.
        assert_eq!(h.worker.process_job(&job.id).await.unwrap(), ProcessOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_timed_out_transaction_is_not_resubmitted() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.chain.withhold_receipts(true);

        let outcome = h.worker.process_job(&job.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { .. }));
        let stored = h.jobs.get_by_id(&job.id).await.unwrap();
        assert!(stored.last_tx_ref.is_some());

        h.chain.release_receipts();
        let outcome = h.worker.process_job(&job.id).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                tx_ref: stored.last_tx_ref.clone()
            }
        );
        assert_eq!(h.chain.submissions_for("register", &record.did), 1);
    }

    #[tokio::test]
    async fn test_already_registered_did_completes_without_submission() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.chain.set_offline(true);
        h.worker.process_job(&job.id).await.unwrap();
        h.chain.set_offline(false);

        // Registered by someone else in the meantime.
        h.ledger
            .register_did(&record.user_hash, &record.did)
            .await
            .unwrap();

        let outcome = h.worker.process_job(&job.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed { tx_ref: None });
        assert_eq!(h.chain.submissions_for("register", &record.did), 1);
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Active);
    }

    #[tokio::test]
    async fn test_revoke_job_revokes_identity() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.worker.process_job(&job.id).await.unwrap();

        let revoke = h.service.revoke(&record.did).await.unwrap();
        let outcome = h.worker.process_job(&revoke.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { tx_ref: Some(_) }));

        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Revoked);
        let resp = h.service.verify(&record.did, None).await.unwrap();
        assert!(!resp.is_valid);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_identity_active() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.worker.process_job(&job.id).await.unwrap();

        let update = h.service.request_update(&record.did).await.unwrap();
        h.chain.set_offline(true);
        for _ in 0..update.max_retries {
            h.worker.process_job(&update.id).await.unwrap();
        }

        let job = h.jobs.get_by_id(&update.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Active);
    }

    #[tokio::test]
    async fn test_orphan_sweep_creates_missing_job() {
        let h = Harness::new();
        let record = h.create_identity().await;

        let report = h.worker.poll_once().await.unwrap();
        assert_eq!(report.orphans, 1);
        assert_eq!(report.completed, 1);
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Active);

        let report = h.worker.poll_once().await.unwrap();
        assert_eq!(report.orphans, 0);
    }

    #[tokio::test]
    async fn test_orphan_sweep_respects_grace_period() {
        let h = Harness::with_config(WorkerConfig {
            orphan_grace: Duration::from_secs(3600),
            ..WorkerConfig::default()
        });
        h.create_identity().await;
        assert_eq!(h.worker.poll_once().await.unwrap().orphans, 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_released() {
        let h = Harness::with_config(WorkerConfig {
            claim_lease: Duration::ZERO,
            orphan_grace: Duration::ZERO,
            ..WorkerConfig::default()
        });
        let (record, job) = created(&h).await;
        // A driver that claimed and then vanished.
        h.jobs.claim(&job.id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = h.worker.poll_once().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.completed, 1);
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Active);
    }

    #[tokio::test]
    async fn test_queued_jobs_keep_their_claims() {
        // Confirmation timeout is 200ms, so the fourth job waits ~600ms in
        // the submission queue, longer than the lease.
        let h = Harness::with_config(WorkerConfig {
            claim_lease: Duration::from_millis(500),
            orphan_grace: Duration::ZERO,
            ..WorkerConfig::default()
        });
        h.chain.withhold_receipts(true);
        let mut jobs = Vec::new();
        for _ in 0..4 {
            jobs.push(created(&h).await);
        }

        let drivers: Vec<_> = jobs
            .iter()
            .map(|(_, job)| {
                let worker = h.worker.clone();
                let id = job.id;
                tokio::spawn(async move { worker.process_job(&id).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(520)).await;
        let released = h
            .jobs
            .release_stale_claims(chrono::Duration::milliseconds(500))
            .await
            .unwrap();
        assert!(released.is_empty(), "in-flight jobs released: {:?}", released);

        for driver in drivers {
            let outcome = driver.await.unwrap().unwrap();
            assert!(
                matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }),
                "unexpected outcome {:?}",
                outcome
            );
        }
        for (record, _) in &jobs {
            assert_eq!(h.chain.submissions_for("register", &record.did), 1);
        }
    }

    #[tokio::test]
    async fn test_driver_that_lost_its_claim_gives_way() {
        let h = Harness::new();
        let (record, job) = created(&h).await;
        h.chain.withhold_receipts(true);

        let worker = h.worker.clone();
        let id = job.id;
        let driver = tokio::spawn(async move { worker.process_job(&id).await });

        // While the first driver waits on its receipt, the claim is released
        // and a second driver finishes the job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.jobs
            .update_status(&job.id, JobStatus::Retrying, Some("claim lease expired"))
            .await
            .unwrap();
        h.jobs.claim(&job.id).await.unwrap().unwrap();
        h.jobs.mark_completed(&job.id).await.unwrap();

        let outcome = driver.await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);

        let stored = h.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_tx_ref.is_some());
        let identity = h.identities.get_by_id(&record.id).await.unwrap();
        assert_eq!(identity.status, DidStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new();
        let (record, _) = created(&h).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        let mut active = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if h.identities.get_by_id(&record.id).await.unwrap().status == DidStatus::Active {
                active = true;
                break;
            }
        }
        assert!(active);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
