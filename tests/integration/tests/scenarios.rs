//! Integration test: identity issuance through registry anchoring.
//!
//! Drives the Identity Service, Reconciliation Worker, queue and Ledger
//! Client together against the in-memory registry.

use std::sync::Arc;
use std::time::Duration;

use anchor_core::{DidStatus, JobStatus, JobType, UserId};
use anchor_integration_tests::{
    eventually, fast_stream_config, fast_worker_config, new_chain, temp_dir, Stack,
};
use anchor_queue::{JobStream, QueueJournal};
use anchor_service::{ProcessOutcome, VerificationReason};
use anchor_store::{IdentityStore, JobLedger, RocksStore};
use futures::future::join_all;
use tokio::sync::watch;

async fn create(stack: &Stack) -> anchor_service::CreatedIdentity {
    stack
        .service
        .create(UserId::new(), "Alice Santos", "alice@example.com")
        .await
        .expect("create should succeed")
}

// =========================================================================
// Scenario A: fresh user through to an anchored DID
// =========================================================================

#[tokio::test]
async fn test_create_then_process_anchors_did() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;

    assert_eq!(created.record.status, DidStatus::Pending);
    assert!(created.record.chain_tx.is_none());
    let jobs = stack.jobs.list_by_did_ref(&created.record.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::Register);
    assert_eq!(jobs[0].status, JobStatus::Pending);

    let outcome = stack.worker.process_job(&jobs[0].id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));

    let job = stack.jobs.get_by_id(&jobs[0].id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.processed_at.is_some());

    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Active);
    assert!(!record.chain_tx.unwrap_or_default().is_empty());
}

// =========================================================================
// Scenario B: reverted registration
// =========================================================================

#[tokio::test]
async fn test_reverted_registration_is_retried() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    let job_id = created.job.unwrap().id;
    stack.chain.revert_next(1);

    let outcome = stack.worker.process_job(&job_id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));

    let job = stack.jobs.get_by_id(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert!(!job.error.clone().unwrap_or_default().is_empty());
    assert!(job.last_tx_ref.is_some());
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Pending);

    // Next attempt goes through.
    let outcome = stack.worker.process_job(&job_id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Active);
}

#[tokio::test]
async fn test_exhausted_registration_dead_letters_then_requeues() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    let job_id = created.job.unwrap().id;
    stack.chain.revert_next(10);

    for _ in 0..3 {
        stack.worker.process_job(&job_id).await.unwrap();
    }
    let job = stack.jobs.get_by_id(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(stack.jobs.get_pending_jobs(100).await.unwrap().is_empty());
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Failed);

    let dead = stack.service.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);

    stack.chain.revert_next(0);
    stack.service.requeue_dead_letter(&job_id).await.unwrap();
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Pending);

    let report = stack.worker.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Active);
    assert!(stack.service.dead_letters(10).await.unwrap().is_empty());
}

// =========================================================================
// Scenario C: verification with the wrong hash
// =========================================================================

#[tokio::test]
async fn test_wrong_hash_is_negative_without_mutation() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    stack
        .worker
        .process_job(&created.job.unwrap().id)
        .await
        .unwrap();
    let before = stack.identities.get_by_id(&created.record.id).await.unwrap();

    let resp = stack
        .service
        .verify(&created.record.did, Some(&"ff".repeat(32)))
        .await
        .unwrap();
    assert!(!resp.is_valid);
    assert_eq!(resp.reason, VerificationReason::HashMismatch);

    let after = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(before, after);

    let resp = stack
        .service
        .verify(&created.record.did, Some(&created.record.user_hash))
        .await
        .unwrap();
    assert!(resp.is_valid);
}

#[tokio::test]
async fn test_registry_outage_falls_back_to_local_status() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    stack.chain.set_offline(true);

    let resp = stack.service.status(&created.record.did).await.unwrap();
    assert!(!resp.is_valid);
    assert_eq!(resp.reason, VerificationReason::LocalFallback);

    // Creation keeps working while the registry is down.
    let other = create(&stack).await;
    assert!(other.job.is_some());
}

// =========================================================================
// Scenario D: concurrent drivers on one job
// =========================================================================

#[tokio::test]
async fn test_concurrent_deliveries_submit_once() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    let job_id = created.job.unwrap().id;

    let handles = (0..8).map(|_| {
        let worker = stack.worker.clone();
        tokio::spawn(async move { worker.process_job(&job_id).await })
    });
    let mut completed = 0;
    let mut skipped = 0;
    for result in join_all(handles).await {
        match result.unwrap().unwrap() {
            ProcessOutcome::Completed { .. } => completed += 1,
            ProcessOutcome::Skipped => skipped += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(skipped, 7);
    assert_eq!(
        stack.chain.submissions_for("register", &created.record.did),
        1
    );
    assert_eq!(stack.ledger.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_queue_and_poller_together_anchor_each_did_once() {
    let stack = Stack::in_memory();
    let _subscriptions = stack.worker.subscribe_all().await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(stack.worker.clone().run(shutdown_rx));

    let mut created = Vec::new();
    for _ in 0..5 {
        created.push(create(&stack).await);
    }

    let s = &stack;
    for c in &created {
        let id = c.record.id;
        let active = eventually(Duration::from_secs(5), move || async move {
            s.identities
                .get_by_id(&id)
                .await
                .map(|r| r.status == DidStatus::Active)
                .unwrap_or(false)
        })
        .await;
        assert!(active, "DID {} never became active", c.record.did);
    }

    for c in &created {
        assert_eq!(stack.chain.submissions_for("register", &c.record.did), 1);
    }
    let mut nonces: Vec<u64> = stack.chain.accepted().iter().map(|t| t.tx.nonce).collect();
    nonces.sort_unstable();
    assert_eq!(nonces, (0..5).collect::<Vec<_>>());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), poller)
        .await
        .unwrap()
        .unwrap();
}

// =========================================================================
// Lifecycle after registration
// =========================================================================

#[tokio::test]
async fn test_update_and_revoke_through_queue() {
    let stack = Stack::in_memory();
    let _subscriptions = stack.worker.subscribe_all().await.unwrap();
    let created = create(&stack).await;
    let id = created.record.id;
    let s = &stack;

    let active = eventually(Duration::from_secs(5), move || async move {
        s.identities
            .get_by_id(&id)
            .await
            .map(|r| r.status == DidStatus::Active)
            .unwrap_or(false)
    })
    .await;
    assert!(active);

    let update = stack.service.request_update(&created.record.did).await.unwrap();
    let update_id = update.id;
    let updated = eventually(Duration::from_secs(5), move || async move {
        s.jobs
            .get_by_id(&update_id)
            .await
            .map(|j| j.status == JobStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(updated);
    assert_eq!(stack.chain.submissions_for("update", &created.record.did), 1);

    stack.service.revoke(&created.record.did).await.unwrap();
    let revoked = eventually(Duration::from_secs(5), move || async move {
        s.identities
            .get_by_id(&id)
            .await
            .map(|r| r.status == DidStatus::Revoked)
            .unwrap_or(false)
    })
    .await;
    assert!(revoked);

    let resp = stack.service.verify(&created.record.did, None).await.unwrap();
    assert!(!resp.is_valid);
    let stats = stack.ledger.stats().await.unwrap();
    assert_eq!(stats.revoked, 1);
    assert_eq!(stats.active, 0);
}

// =========================================================================
// Recovery
// =========================================================================

#[tokio::test]
async fn test_orphaned_identity_is_recovered_by_sweep() {
    let stack = Stack::in_memory();
    let created = create(&stack).await;
    let job_id = created.job.unwrap().id;
    // Simulate the crash window between the two writes.
    stack
        .jobs
        .update_status(&job_id, JobStatus::Completed, None)
        .await
        .unwrap();
    stack.jobs.cleanup_completed(0).await.unwrap();
    assert!(stack
        .jobs
        .list_by_did_ref(&created.record.id)
        .await
        .unwrap()
        .is_empty());

    let report = stack.worker.poll_once().await.unwrap();
    assert_eq!(report.orphans, 1);
    assert_eq!(report.completed, 1);
    let record = stack.identities.get_by_id(&created.record.id).await.unwrap();
    assert_eq!(record.status, DidStatus::Active);
}

#[tokio::test]
async fn test_pending_work_survives_restart() {
    let dir = temp_dir("restart");
    let chain = new_chain();
    let did;
    {
        let store = Arc::new(RocksStore::open(&dir.join("store")).unwrap());
        let journal = QueueJournal::open(&dir.join("queue")).unwrap();
        let stream = JobStream::open(fast_stream_config(), journal).unwrap();
        let stack = Stack::assemble(
            store.clone(),
            store,
            stream,
            chain.clone(),
            fast_worker_config(),
        );
        did = create(&stack).await.record.did;
    }

    let store = Arc::new(RocksStore::open(&dir.join("store")).unwrap());
    let journal = QueueJournal::open(&dir.join("queue")).unwrap();
    let stream = JobStream::open(fast_stream_config(), journal).unwrap();
    assert_eq!(stream.info().unwrap().messages, 1);
    let stack = Stack::assemble(store.clone(), store, stream, chain, fast_worker_config());

    let record = stack.identities.get_by_did(&did).await.unwrap();
    assert_eq!(record.status, DidStatus::Pending);
    let report = stack.worker.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(stack.service.status(&did).await.unwrap().is_valid);

    drop(stack);
    std::fs::remove_dir_all(&dir).ok();
}
