use std::sync::Arc;
use std::time::Duration;

use anchor_crypto::KeyPair;
use tokio::sync::{mpsc, oneshot};

use crate::call::RegistryCall;
use crate::error::LedgerError;
use crate::rpc::ChainRpc;
use crate::submitter::{SubmitRequest, Submitter};
use crate::transaction::TxStatus;
use crate::types::{RegistryEntry, RegistryStats};

/// Ledger Client settings.
#[derive(Debug, Clone)]
pub struct LedgerClientConfig {
    pub contract_address: String,
    /// Bound on waiting for a receipt after broadcast.
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    /// Writes that may queue up behind the one in flight.
    pub queue_depth: usize,
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self {
            contract_address: String::new(),
            confirmation_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            queue_depth: 256,
        }
    }
}

/// Handle to the registry. Clones share the same submission actor.
#[derive(Clone)]
pub struct LedgerClient {
    rpc: Arc<dyn ChainRpc>,
    contract: String,
    signer: String,
    submit_tx: mpsc::Sender<SubmitRequest>,
}

impl LedgerClient {
    /// Start the submission actor for `keypair` and return a client for it.
    ///
    /// The actor stops once the last clone of the client is dropped.
    pub fn spawn(rpc: Arc<dyn ChainRpc>, keypair: KeyPair, config: LedgerClientConfig) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_depth.max(1));
        let submitter = Submitter::new(
            rpc.clone(),
            keypair,
            config.contract_address.clone(),
            config.confirmation_timeout,
            config.poll_interval,
        );
        let signer = submitter.account().to_string();
        tokio::spawn(submitter.run(submit_rx));

        Self {
            rpc,
            contract: config.contract_address,
            signer,
            submit_tx,
        }
    }

    /// Hex public key of the signing account.
    pub fn signer(&self) -> &str {
        &self.signer
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    async fn submit(&self, call: RegistryCall) -> Result<String, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.submit_tx
            .send(SubmitRequest { call, reply })
            .await
            .map_err(|_| LedgerError::SubmitterStopped)?;
        rx.await.map_err(|_| LedgerError::SubmitterStopped)?
    }

    /// Register a DID; returns the confirmed transaction reference.
    pub async fn register_did(&self, user_hash: &str, did: &str) -> Result<String, LedgerError> {
        self.submit(RegistryCall::Register {
            user_hash: user_hash.to_string(),
            did: did.to_string(),
            metadata: String::new(),
        })
        .await
    }

    pub async fn update_did(&self, user_hash: &str, did: &str) -> Result<String, LedgerError> {
        self.submit(RegistryCall::Update {
            user_hash: user_hash.to_string(),
            did: did.to_string(),
            metadata: String::new(),
        })
        .await
    }

    pub async fn revoke_did(&self, user_hash: &str) -> Result<String, LedgerError> {
        self.submit(RegistryCall::Revoke {
            user_hash: user_hash.to_string(),
        })
        .await
    }

    /// Whether the registry reports the DID active and not revoked.
    pub async fn verify_did(&self, did: &str) -> Result<bool, LedgerError> {
        Ok(self.lookup(did).await?.is_valid)
    }

    pub async fn lookup(&self, did: &str) -> Result<RegistryEntry, LedgerError> {
        self.rpc.verify(&self.contract, did).await
    }

    pub async fn stats(&self) -> Result<RegistryStats, LedgerError> {
        self.rpc.stats(&self.contract).await
    }

    /// Status of a transaction broadcast earlier, for retry decisions.
    pub async fn transaction_status(&self, tx_ref: &str) -> Result<TxStatus, LedgerError> {
        Ok(self.rpc.receipt(tx_ref).await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryChain;

    const CONTRACT: &str = "0xregistry";

    fn client_with(chain: Arc<InMemoryChain>, timeout: Duration) -> LedgerClient {
        LedgerClient::spawn(
            chain,
            KeyPair::generate().unwrap(),
            LedgerClientConfig {
                contract_address: CONTRACT.into(),
                confirmation_timeout: timeout,
                poll_interval: Duration::from_millis(5),
                queue_depth: 16,
            },
        )
    }

    fn hash(n: u8) -> String {
        hex::encode([n; 32])
    }

    #[tokio::test]
    async fn test_register_confirms() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_secs(5));

        let tx_ref = client.register_did(&hash(1), "did:one").await.unwrap();
        assert!(tx_ref.starts_with("0x"));
        assert!(client.verify_did("did:one").await.unwrap());
        assert_eq!(
            client.transaction_status(&tx_ref).await.unwrap(),
            TxStatus::Confirmed { block_number: 1 }
        );
        assert_eq!(
            client.lookup("did:one").await.unwrap().user_hash,
            Some(hash(1))
        );
    }

    #[tokio::test]
    async fn test_concurrent_writes_get_distinct_nonces() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_secs(5));

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.register_did(&hash(i), &format!("did:{}", i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let mut nonces: Vec<u64> = chain.accepted().iter().map(|t| t.tx.nonce).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, (0..8).collect::<Vec<_>>());
        assert_eq!(client.stats().await.unwrap().active, 8);
    }

    #[tokio::test]
    async fn test_reverted_receipt() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_secs(5));
        chain.revert_next(1);

        let err = client.register_did(&hash(2), "did:two").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionReverted { .. }));
        assert!(err.is_recoverable());
        assert!(err.tx_ref().is_some());
    }

    #[tokio::test]
    async fn test_timeout_keeps_tx_ref() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_millis(50));
        chain.withhold_receipts(true);

        let err = client.register_did(&hash(3), "did:three").await.unwrap_err();
        let tx_ref = err.tx_ref().unwrap().to_string();
        assert!(matches!(err, LedgerError::TransactionTimeout { .. }));
        assert_eq!(client.transaction_status(&tx_ref).await.unwrap(), TxStatus::Unknown);

        // The transaction landed after all.
        chain.release_receipts();
        assert!(matches!(
            client.transaction_status(&tx_ref).await.unwrap(),
            TxStatus::Confirmed { .. }
        ));
    }

    #[tokio::test]
    async fn test_nonce_resyncs_after_outage() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_secs(5));

        client.register_did(&hash(4), "did:four").await.unwrap();
        chain.set_offline(true);
        assert!(matches!(
            client.register_did(&hash(5), "did:five").await,
            Err(LedgerError::ChainUnavailable(_))
        ));
        chain.set_offline(false);
        client.register_did(&hash(5), "did:five").await.unwrap();

        let nonces: Vec<u64> = chain.accepted().iter().map(|t| t.tx.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_nonce_resyncs_after_dropped_transaction() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_millis(50));
        chain.drop_next(1);

        let err = client.register_did(&hash(6), "did:six").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionTimeout { waited_ms: 50, .. }));

        // Nonce 0 was never mined, so the next write must reuse it.
        client.register_did(&hash(7), "did:seven").await.unwrap();
        assert!(client.verify_did("did:seven").await.unwrap());
        let nonces: Vec<u64> = chain.accepted().iter().map(|t| t.tx.nonce).collect();
        assert_eq!(nonces, vec![0]);
    }

    #[tokio::test]
    async fn test_encoding_error_is_not_recoverable() {
        let chain = Arc::new(InMemoryChain::new(1, CONTRACT));
        let client = client_with(chain.clone(), Duration::from_secs(5));
        let err = client.revoke_did("not-hex").await.unwrap_err();
        assert!(matches!(err, LedgerError::Encoding(_)));
        assert!(!err.is_recoverable());
        assert!(chain.accepted().is_empty());
    }
}
