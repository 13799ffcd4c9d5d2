//! The Anchor node orchestrator.
//!
//! Opens storage and the job stream, starts the registry client, attaches the
//! Reconciliation Worker to the queue and its poller, and serves the HTTP API.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anchor_crypto::{IdentityGenerator, KeyPair};
use anchor_ledger::{ChainRpc, InMemoryChain, JsonRpcChain, LedgerClient};
use anchor_queue::{JobStream, QueueJournal, QueueTransport, Subscription};
use anchor_service::{IdentityService, ReconciliationWorker};
use anchor_store::{IdentityStore, JobLedger, MemoryStore, RocksStore};
use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::api::AppState;
use crate::config::{AnchorConfig, LedgerBackend, StorageBackend};

/// A running Anchor node.
pub struct AnchorNode {
    config: AnchorConfig,
    /// Shared state accessible from HTTP handlers.
    state: Option<AppState>,
    subscriptions: Vec<Subscription>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker_task: Option<JoinHandle<()>>,
    api_task: Option<JoinHandle<()>>,
}

type Stores = (Arc<dyn IdentityStore>, Arc<dyn JobLedger>);

impl AnchorNode {
    pub fn new(config: AnchorConfig) -> Result<Self> {
        Ok(Self {
            config,
            state: None,
            subscriptions: Vec::new(),
            shutdown_tx: None,
            worker_task: None,
            api_task: None,
        })
    }

    /// Open storage, start the worker and the HTTP API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting Anchor node");

        let data_dir = self.config.storage.data_dir.clone();
        let (identities, jobs) = open_stores(self.config.storage.backend, &data_dir)?;
        let queue: Arc<dyn QueueTransport> = Arc::new(self.open_stream(&data_dir)?);

        let keypair = load_or_generate_keypair(&self.config.signer_key_path())?;
        let rpc = self.chain_rpc()?;
        let ledger = LedgerClient::spawn(rpc, keypair, self.config.ledger_client_config());
        tracing::info!(
            signer = %ledger.signer(),
            contract = %ledger.contract(),
            backend = ?self.config.ledger.backend,
            "ledger client started"
        );

        let worker_config = self.config.worker_config();
        let service = Arc::new(
            IdentityService::new(
                IdentityGenerator::new(self.config.identity.hash_policy),
                identities.clone(),
                jobs.clone(),
                queue.clone(),
                ledger.clone(),
            )
            .with_max_retries(worker_config.max_retries),
        );
        let worker = Arc::new(ReconciliationWorker::new(
            identities,
            jobs,
            queue,
            ledger,
            worker_config,
        ));

        self.subscriptions = worker.subscribe_all().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.worker_task = Some(tokio::spawn(worker.clone().run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);

        let state = AppState { service, worker };
        let api_addr: SocketAddr = self.config.api_addr().parse()?;
        let api_state = state.clone();
        self.api_task = Some(tokio::spawn(async move {
            if let Err(e) = crate::api::start_api_server(api_addr, api_state).await {
                tracing::error!(error = %e, "HTTP API server error");
            }
        }));
        self.state = Some(state);

        Ok(())
    }

    fn open_stream(&self, data_dir: &Path) -> Result<JobStream> {
        let config = self.config.stream_config();
        let stream = match self.config.storage.backend {
            StorageBackend::Rocksdb => {
                let journal = QueueJournal::open(&data_dir.join("queue"))?;
                JobStream::open(config, journal)?
            }
            StorageBackend::Memory => JobStream::in_memory(config),
        };
        let info = stream.info()?;
        tracing::info!(
            stream = %info.name,
            messages = info.messages,
            dead_letters = info.dead_letters,
            "job stream ready"
        );
        Ok(stream)
    }

    fn chain_rpc(&self) -> Result<Arc<dyn ChainRpc>> {
        let ledger = &self.config.ledger;
        let rpc: Arc<dyn ChainRpc> = match ledger.backend {
            LedgerBackend::JsonRpc => Arc::new(JsonRpcChain::new(
                ledger.rpc_url.clone(),
                Duration::from_secs(ledger.request_timeout_secs),
            )?),
            LedgerBackend::Memory => {
                tracing::warn!("using in-memory registry; anchoring is not persisted");
                Arc::new(InMemoryChain::new(
                    ledger.chain_id,
                    ledger.contract_address.clone(),
                ))
            }
        };
        Ok(rpc)
    }

    /// Run until the worker loop stops.
    pub async fn run(&mut self) -> Result<()> {
        let worker_task = self
            .worker_task
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        tracing::info!("node running");
        worker_task.await?;
        Ok(())
    }

    /// Stop consumers, the worker and the API server.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down Anchor node");

        for subscription in self.subscriptions.drain(..) {
            subscription.shutdown();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.worker_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("worker did not stop in time");
            }
        }
        if let Some(task) = self.api_task.take() {
            task.abort();
        }
        self.state = None;

        tracing::info!("Anchor node shut down");
        Ok(())
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<&AppState> {
        self.state.as_ref()
    }
}

fn open_stores(backend: StorageBackend, data_dir: &Path) -> Result<Stores> {
    match backend {
        StorageBackend::Rocksdb => {
            let path = data_dir.join("store");
            let store = Arc::new(RocksStore::open(&path)?);
            tracing::info!(path = %path.display(), "storage initialized");
            let identities: Arc<dyn IdentityStore> = store.clone();
            let jobs: Arc<dyn JobLedger> = store;
            Ok((identities, jobs))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; identities are lost on exit");
            let store = Arc::new(MemoryStore::new());
            let identities: Arc<dyn IdentityStore> = store.clone();
            let jobs: Arc<dyn JobLedger> = store;
            Ok((identities, jobs))
        }
    }
}

/// Load the signing account seed from `path`, creating it on first start.
pub fn load_or_generate_keypair(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let contents = Zeroizing::new(std::fs::read_to_string(path)?);
        let keypair = KeyPair::from_hex(&contents)?;
        tracing::info!(path = %path.display(), "loaded signer key");
        return Ok(keypair);
    }

    let keypair = KeyPair::generate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let seed = Zeroizing::new(hex::encode(keypair.secret_bytes()));
    std::fs::write(path, seed.as_bytes())?;
    tracing::info!(path = %path.display(), "generated new signer key");
    Ok(keypair)
}
