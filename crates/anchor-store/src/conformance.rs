//! Behaviour every backend must share. Each backend's test module runs these
//! against a fresh instance.

use anchor_core::{
    BlockchainJob, DidRecord, DidStatus, JobStatus, JobType, UserId, DEFAULT_MAX_RETRIES,
};

use crate::error::StoreError;
use crate::traits::{IdentityStore, JobLedger};

pub(crate) fn record() -> DidRecord {
    let tag = uuid::Uuid::now_v7().simple().to_string();
    DidRecord::new(
        UserId::new(),
        format!("did:example:user:{}:{}", &tag[..16], &tag[16..32]),
        format!("{}{}", tag, tag),
        Some("00".repeat(16)),
        "cd".repeat(32),
    )
}

pub(crate) async fn seed_job<S: IdentityStore + JobLedger>(store: &S) -> BlockchainJob {
    let r = record();
    IdentityStore::create(store, &r).await.unwrap();
    let job = BlockchainJob::new(JobType::Register, &r, DEFAULT_MAX_RETRIES);
    JobLedger::create(store, &job).await.unwrap();
    job
}

pub(crate) async fn identity_contract<S: IdentityStore + JobLedger>(store: &S) {
    let r = record();
    IdentityStore::create(store, &r).await.unwrap();

    assert_eq!(IdentityStore::get_by_id(store, &r.id).await.unwrap(), r);
    assert_eq!(store.get_by_did(&r.did).await.unwrap().id, r.id);
    assert_eq!(store.get_by_user_id(&r.user_id).await.unwrap().id, r.id);
    assert_eq!(store.get_by_user_hash(&r.user_hash).await.unwrap().id, r.id);

    // Duplicate DID and duplicate hash are both conflicts.
    let mut dup_did = record();
    dup_did.did = r.did.clone();
    assert!(matches!(
        IdentityStore::create(store, &dup_did).await,
        Err(StoreError::Conflict(_))
    ));
    let mut dup_hash = record();
    dup_hash.user_hash = r.user_hash.clone();
    assert!(matches!(
        IdentityStore::create(store, &dup_hash).await,
        Err(StoreError::Conflict(_))
    ));

    assert!(matches!(
        store.get_by_did("did:example:user:ffffffffffffffff:ffffffffffffffff").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.get_by_user_id(&UserId::new()).await,
        Err(StoreError::NotFound(_))
    ));

    let updated = IdentityStore::update_status(store, &r.id, DidStatus::Active, Some("0xabc"))
        .await
        .unwrap();
    assert_eq!(updated.status, DidStatus::Active);
    assert_eq!(updated.chain_tx.as_deref(), Some("0xabc"));
    assert!(updated.updated_at >= r.updated_at);

    // A status change without a transaction keeps the previous one.
    let revoked = IdentityStore::update_status(store, &r.id, DidStatus::Revoked, None)
        .await
        .unwrap();
    assert_eq!(revoked.chain_tx.as_deref(), Some("0xabc"));

    let mut edited = revoked.clone();
    edited.public_key = "ef".repeat(32);
    assert_eq!(store.update(&edited).await.unwrap().public_key, "ef".repeat(32));
    edited.did = "did:example:user:aaaaaaaaaaaaaaaa:bbbbbbbbbbbbbbbb".into();
    assert!(matches!(store.update(&edited).await, Err(StoreError::Conflict(_))));

    let second = record();
    IdentityStore::create(store, &second).await.unwrap();
    let pending = store.list_by_status(DidStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second.id);
    assert_eq!(store.list_by_status(DidStatus::Revoked).await.unwrap().len(), 1);
}

pub(crate) async fn job_contract<S: IdentityStore + JobLedger>(store: &S) {
    let first = seed_job(store).await;
    let second = seed_job(store).await;
    let third = seed_job(store).await;

    assert!(matches!(
        JobLedger::create(store, &first).await,
        Err(StoreError::Conflict(_))
    ));

    // FIFO and bounded.
    let pending = store.get_pending_jobs(2).await.unwrap();
    assert_eq!(
        pending.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    // Claim is exclusive.
    let claimed = store.claim(&first.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, JobStatus::Processing);
    assert!(store.claim(&first.id).await.unwrap().is_none());
    let pending = store.get_pending_jobs(10).await.unwrap();
    assert!(pending.iter().all(|j| j.id != first.id));

    // Success path.
    store.record_tx_ref(&first.id, "0x01").await.unwrap();
    let done = store.mark_completed(&first.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.processed_at.is_some());
    assert_eq!(done.last_tx_ref.as_deref(), Some("0x01"));
    assert!(store.mark_completed(&first.id).await.is_err());

    // Retry path until the budget runs out.
    for attempt in 1..=DEFAULT_MAX_RETRIES {
        store.claim(&second.id).await.unwrap().unwrap();
        let j = store
            .increment_retry_count(&second.id, "confirmation timed out")
            .await
            .unwrap();
        assert_eq!(j.status, JobStatus::Retrying);
        assert_eq!(j.retry_count, attempt);
        assert_eq!(j.error.as_deref(), Some("confirmation timed out"));
    }
    assert!(store.claim(&second.id).await.unwrap().is_none());
    let pending = store.get_pending_jobs(10).await.unwrap();
    assert!(pending.iter().all(|j| j.retry_count < j.max_retries));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, third.id);

    let dead = store.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, second.id);

    let requeued = store.requeue(&second.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 0);
    assert!(store.list_dead_letters(10).await.unwrap().is_empty());
    assert!(matches!(
        store.requeue(&third.id).await,
        Err(StoreError::Conflict(_))
    ));

    // Unrecoverable failure.
    let failed = JobLedger::update_status(store, &third.id, JobStatus::Failed, Some("reverted"))
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("reverted"));
    assert!(store.claim(&third.id).await.unwrap().is_none());

    let by_ref = store.list_by_did_ref(&third.did_ref).await.unwrap();
    assert_eq!(by_ref.len(), 1);

    assert!(matches!(
        JobLedger::get_by_id(store, &anchor_core::JobId::new()).await,
        Err(StoreError::NotFound(_))
    ));
}

pub(crate) async fn retention<S: IdentityStore + JobLedger>(store: &S) {
    let done = seed_job(store).await;
    store.claim(&done.id).await.unwrap();
    store.mark_completed(&done.id).await.unwrap();
    let open = seed_job(store).await;

    // Nothing is old enough yet.
    assert_eq!(store.cleanup_completed(7).await.unwrap(), 0);
    // A zero-day window removes every completed row and nothing else.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(store.cleanup_completed(0).await.unwrap(), 1);
    assert!(JobLedger::get_by_id(store, &done.id).await.is_err());
    assert!(JobLedger::get_by_id(store, &open.id).await.is_ok());

    // Stale claims go back to retrying with the attempt counted.
    store.claim(&open.id).await.unwrap().unwrap();
    assert!(store
        .release_stale_claims(chrono::Duration::seconds(60))
        .await
        .unwrap()
        .is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let released = store
        .release_stale_claims(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].status, JobStatus::Retrying);
    assert_eq!(released[0].retry_count, 1);
    assert!(store.claim(&open.id).await.unwrap().is_some());

    // Renewing keeps a long-running claim from looking abandoned.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(store.renew_claim(&open.id).await.unwrap());
    assert!(store
        .release_stale_claims(chrono::Duration::milliseconds(80))
        .await
        .unwrap()
        .is_empty());
    store.mark_completed(&open.id).await.unwrap();
    assert!(!store.renew_claim(&open.id).await.unwrap());
}
