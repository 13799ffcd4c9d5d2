use std::sync::Arc;
use std::time::Duration;

use anchor_core::{DidRecord, UserId};
use anchor_crypto::{HashPolicy, IdentityGenerator, KeyPair};
use anchor_ledger::{InMemoryChain, LedgerClient, LedgerClientConfig};
use anchor_queue::{JobStream, StreamConfig};
use anchor_store::{IdentityStore, JobLedger, MemoryStore};

use crate::config::WorkerConfig;
use crate::service::IdentityService;
use crate::worker::ReconciliationWorker;

pub const CONTRACT: &str = "0xregistry";

/// Fully in-memory stack.
pub struct Harness {
    pub identities: Arc<dyn IdentityStore>,
    pub jobs: Arc<dyn JobLedger>,
    pub stream: JobStream,
    pub chain: Arc<InMemoryChain>,
    pub ledger: LedgerClient,
    pub service: IdentityService,
    pub worker: Arc<ReconciliationWorker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(WorkerConfig {
            poll_interval: Duration::from_millis(20),
            claim_lease: Duration::from_secs(60),
            orphan_grace: Duration::ZERO,
            ..WorkerConfig::default()
        })
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stream = JobStream::in_memory(StreamConfig {
            nak_delay: Duration::from_millis(10),
            ..StreamConfig::default()
        });
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let ledger = LedgerClient::spawn(
            chain.clone(),
            KeyPair::generate().unwrap(),
            LedgerClientConfig {
                contract_address: CONTRACT.into(),
                confirmation_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(5),
                queue_depth: 16,
            },
        );
        let queue = Arc::new(stream.clone());

        let service = IdentityService::new(
            IdentityGenerator::new(HashPolicy::Salted),
            store.clone(),
            store.clone(),
            queue.clone(),
            ledger.clone(),
        )
        .with_max_retries(config.max_retries);
        let worker = Arc::new(ReconciliationWorker::new(
            store.clone(),
            store.clone(),
            queue,
            ledger.clone(),
            config,
        ));

        Self {
            identities: store.clone(),
            jobs: store,
            stream,
            chain,
            ledger,
            service,
            worker,
        }
    }

    /// Persist a pending identity without scheduling any job.
    pub async fn create_identity(&self) -> DidRecord {
        let generated = IdentityGenerator::default()
            .generate(UserId::new(), "Ada", "ada@example.com")
            .unwrap();
        let record = DidRecord::new(
            UserId::new(),
            generated.did,
            generated.user_hash,
            generated.hash_salt,
            generated.public_key.to_hex(),
        );
        self.identities.create(&record).await.unwrap();
        record
    }
}
