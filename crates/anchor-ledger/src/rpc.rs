use async_trait::async_trait;

use crate::error::LedgerError;
use crate::transaction::{Receipt, SignedTransaction};
use crate::types::{RegistryEntry, RegistryStats};

/// Raw access to the chain node hosting the registry contract.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Next nonce for `account`, counting transactions not yet mined.
    async fn pending_nonce(&self, account: &str) -> Result<u64, LedgerError>;

    /// Broadcast a signed transaction; returns its reference.
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError>;

    /// `None` while the transaction is not included.
    async fn receipt(&self, tx_ref: &str) -> Result<Option<Receipt>, LedgerError>;

    /// Stateless registry read.
    async fn verify(&self, contract: &str, did: &str) -> Result<RegistryEntry, LedgerError>;

    async fn stats(&self, contract: &str) -> Result<RegistryStats, LedgerError>;
}
