//! Harness for the cross-crate scenarios: a complete identity stack wired
//! to an in-memory registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anchor_crypto::{IdentityGenerator, KeyPair};
use anchor_ledger::{InMemoryChain, LedgerClient, LedgerClientConfig};
use anchor_queue::{JobStream, StreamConfig};
use anchor_service::{IdentityService, ReconciliationWorker, WorkerConfig};
use anchor_store::{IdentityStore, JobLedger, MemoryStore};

pub const CONTRACT: &str = "0xregistry";

pub struct Stack {
    pub identities: Arc<dyn IdentityStore>,
    pub jobs: Arc<dyn JobLedger>,
    pub stream: JobStream,
    pub chain: Arc<InMemoryChain>,
    pub ledger: LedgerClient,
    pub service: IdentityService,
    pub worker: Arc<ReconciliationWorker>,
}

/// Short intervals so scenarios finish quickly.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(25),
        batch_size: 50,
        claim_lease: Duration::from_secs(30),
        orphan_grace: Duration::ZERO,
        ..WorkerConfig::default()
    }
}

pub fn fast_stream_config() -> StreamConfig {
    StreamConfig {
        nak_delay: Duration::from_millis(10),
        ..StreamConfig::default()
    }
}

pub fn new_chain() -> Arc<InMemoryChain> {
    Arc::new(InMemoryChain::new(1, CONTRACT))
}

impl Stack {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::assemble(
            store.clone(),
            store,
            JobStream::in_memory(fast_stream_config()),
            new_chain(),
            fast_worker_config(),
        )
    }

    pub fn assemble(
        identities: Arc<dyn IdentityStore>,
        jobs: Arc<dyn JobLedger>,
        stream: JobStream,
        chain: Arc<InMemoryChain>,
        config: WorkerConfig,
    ) -> Self {
        let ledger = LedgerClient::spawn(
            chain.clone(),
            KeyPair::generate().expect("signer key"),
            LedgerClientConfig {
                contract_address: CONTRACT.into(),
                confirmation_timeout: Duration::from_millis(300),
                poll_interval: Duration::from_millis(5),
                queue_depth: 64,
            },
        );
        let queue = Arc::new(stream.clone());
        let service = IdentityService::new(
            IdentityGenerator::default(),
            identities.clone(),
            jobs.clone(),
            queue.clone(),
            ledger.clone(),
        )
        .with_max_retries(config.max_retries);
        let worker = Arc::new(ReconciliationWorker::new(
            identities.clone(),
            jobs.clone(),
            queue,
            ledger.clone(),
            config,
        ));
        Self {
            identities,
            jobs,
            stream,
            chain,
            ledger,
            service,
            worker,
        }
    }
}

/// Fresh directory under the system temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("anchor-it-{}-{}", label, rand::random::<u64>()))
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
