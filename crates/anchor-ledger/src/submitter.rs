//! Single-writer submission actor.
//!
//! Owns the signing key and the account nonce. Requests are handled one at a
//! time from build through confirmation, so two transactions from this
//! account are never in flight together.

use std::sync::Arc;
use std::time::Duration;

use anchor_crypto::KeyPair;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::call::RegistryCall;
use crate::error::LedgerError;
use crate::rpc::ChainRpc;
use crate::transaction::{ChainTransaction, ReceiptStatus, SignedTransaction};

/// A write request sent to the actor.
pub struct SubmitRequest {
    pub call: RegistryCall,
    /// Confirmed transaction reference, or why it was not confirmed.
    pub reply: oneshot::Sender<Result<String, LedgerError>>,
}

pub struct Submitter {
    rpc: Arc<dyn ChainRpc>,
    keypair: KeyPair,
    account: String,
    contract: String,
    chain_id: Option<u64>,
    /// Cached next nonce. Cleared whenever a broadcast fails or a
    /// confirmation times out, which forces a resync from the node.
    next_nonce: Option<u64>,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl Submitter {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        keypair: KeyPair,
        contract: String,
        confirmation_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let account = keypair.public_key().to_hex();
        Self {
            rpc,
            keypair,
            account,
            contract,
            chain_id: None,
            next_nonce: None,
            confirmation_timeout,
            poll_interval,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Serve requests until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SubmitRequest>) {
        tracing::info!(account = %self.account, contract = %self.contract, "submission actor started");
        while let Some(request) = rx.recv().await {
            let op = request.call.name();
            let result = self.submit(&request.call).await;
            if let Err(e) = &result {
                tracing::warn!(op, error = %e, "registry write failed");
            }
            // The caller may have given up; the outcome is still logged.
            let _ = request.reply.send(result);
        }
        tracing::info!(account = %self.account, "submission actor stopped");
    }

    async fn chain_id(&mut self) -> Result<u64, LedgerError> {
        if let Some(id) = self.chain_id {
            return Ok(id);
        }
        let id = self.rpc.chain_id().await?;
        self.chain_id = Some(id);
        Ok(id)
    }

    async fn nonce(&mut self) -> Result<u64, LedgerError> {
        match self.next_nonce {
            Some(n) => Ok(n),
            None => self.rpc.pending_nonce(&self.account).await,
        }
    }

    pub(crate) async fn submit(&mut self, call: &RegistryCall) -> Result<String, LedgerError> {
        let chain_id = self.chain_id().await?;
        let nonce = self.nonce().await?;
        let tx = ChainTransaction::new(chain_id, nonce, &self.account, &self.contract, call)?;
        let signed = SignedTransaction::sign(tx, &self.keypair);

        let tx_ref = match self.rpc.send_transaction(&signed).await {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                self.next_nonce = None;
                return Err(e);
            }
        };
        self.next_nonce = Some(nonce + 1);
        tracing::info!(op = call.name(), nonce, tx_ref = %tx_ref, "transaction broadcast");

        let result = self.await_confirmation(tx_ref).await;
        if let Err(LedgerError::TransactionTimeout { tx_ref, .. }) = &result {
            // The node may have evicted it; building on nonce + 1 would leave a gap.
            tracing::debug!(tx_ref = %tx_ref, nonce, "confirmation timed out, nonce cache cleared");
            self.next_nonce = None;
        }
        result
    }

    /// Poll for the receipt until it shows up or the timeout fires.
    async fn await_confirmation(&self, tx_ref: String) -> Result<String, LedgerError> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.rpc.receipt(&tx_ref).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(tx_ref = %tx_ref, error = %e, "receipt poll failed");
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(self.confirmation_timeout, poll).await;
        match outcome {
            Ok(receipt) if receipt.status == ReceiptStatus::Success => {
                tracing::info!(tx_ref = %tx_ref, block = receipt.block_number, "transaction confirmed");
                Ok(tx_ref)
            }
            Ok(receipt) => Err(LedgerError::TransactionReverted {
                tx_ref,
                reason: receipt.reason.unwrap_or_else(|| "reverted".into()),
            }),
            Err(_) => Err(LedgerError::TransactionTimeout {
                tx_ref,
                waited_ms: self.confirmation_timeout.as_millis() as u64,
            }),
        }
    }
}
