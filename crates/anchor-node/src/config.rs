//! Node configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anchor_crypto::HashPolicy;
use anchor_ledger::LedgerClientConfig;
use anchor_queue::StreamConfig;
use anchor_service::WorkerConfig;
use serde::{Deserialize, Serialize};

/// Full configuration for the Anchor node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnchorConfig {
    /// API server settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Identity Store and Job Ledger settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Job stream settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Registry access settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Reconciliation Worker settings.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Identity generation settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API listen address.
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    /// API port.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where identities, jobs and the queue journal live.
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Deliveries per consumer before a message is dead-lettered.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,
    #[serde(default = "default_nak_delay_ms")]
    pub nak_delay_ms: u64,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerBackend {
    JsonRpc,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_backend")]
    pub backend: LedgerBackend,
    /// Registry node JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_contract_address")]
    pub contract_address: String,
    /// Hex seed of the signing account. Generated on first start when
    /// missing; defaults to `<data_dir>/signer.key`.
    #[serde(default)]
    pub signer_key_path: Option<PathBuf>,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_ledger_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Chain id used by the in-memory registry.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
    #[serde(default = "default_retention_days")]
    pub completed_retention_days: u32,
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub hash_policy: HashPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

// Default value functions
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    8082
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_storage_backend() -> StorageBackend {
    StorageBackend::Rocksdb
}
fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_messages() -> usize {
    10_000
}
fn default_max_deliver() -> u32 {
    3
}
fn default_nak_delay_ms() -> u64 {
    1000
}
fn default_consumer_name() -> String {
    "did-manager-worker".into()
}
fn default_ledger_backend() -> LedgerBackend {
    LedgerBackend::JsonRpc
}
fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".into()
}
fn default_contract_address() -> String {
    "0x0000000000000000000000000000000000000000".into()
}
fn default_confirmation_timeout_secs() -> u64 {
    300
}
fn default_ledger_poll_interval_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_chain_id() -> u64 {
    1337
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    anchor_core::DEFAULT_MAX_RETRIES
}
fn default_claim_lease_secs() -> u64 {
    600
}
fn default_orphan_grace_secs() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    7
}
fn default_retention_interval_secs() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: default_storage_backend(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            max_messages: default_max_messages(),
            max_deliver: default_max_deliver(),
            nak_delay_ms: default_nak_delay_ms(),
            consumer_name: default_consumer_name(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: default_ledger_backend(),
            rpc_url: default_rpc_url(),
            contract_address: default_contract_address(),
            signer_key_path: None,
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            poll_interval_ms: default_ledger_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            chain_id: default_chain_id(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            claim_lease_secs: default_claim_lease_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            completed_retention_days: default_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AnchorConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: AnchorConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.listen_addr, self.api.port)
    }

    pub fn signer_key_path(&self) -> PathBuf {
        self.ledger
            .signer_key_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("signer.key"))
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_age: Duration::from_secs(self.queue.max_age_secs),
            max_messages: self.queue.max_messages,
            max_deliver: self.queue.max_deliver,
            nak_delay: Duration::from_millis(self.queue.nak_delay_ms),
            consumer_name: self.queue.consumer_name.clone(),
            ..StreamConfig::default()
        }
    }

    pub fn ledger_client_config(&self) -> LedgerClientConfig {
        LedgerClientConfig {
            contract_address: self.ledger.contract_address.clone(),
            confirmation_timeout: Duration::from_secs(self.ledger.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.ledger.poll_interval_ms),
            ..LedgerClientConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_secs(self.worker.poll_interval_secs),
            batch_size: self.worker.batch_size,
            max_retries: self.worker.max_retries,
            claim_lease: Duration::from_secs(self.worker.claim_lease_secs),
            orphan_grace: Duration::from_secs(self.worker.orphan_grace_secs),
            completed_retention_days: self.worker.completed_retention_days,
            retention_interval: Duration::from_secs(self.worker.retention_interval_secs),
        }
    }
}
