//! JSON-RPC 2.0 transport to a registry node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::LedgerError;
use crate::rpc::ChainRpc;
use crate::transaction::{Receipt, SignedTransaction};
use crate::types::{RegistryEntry, RegistryStats};

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// [`ChainRpc`] over HTTP using the `registry_*` method namespace.
pub struct JsonRpcChain {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

fn transport_error(e: reqwest::Error) -> LedgerError {
    if e.is_connect() || e.is_timeout() {
        LedgerError::ChainUnavailable(e.to_string())
    } else {
        LedgerError::Rpc(e.to_string())
    }
}

impl JsonRpcChain {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Rpc(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::ChainUnavailable(format!(
                "{} returned {}",
                method, status
            )));
        }
        if !status.is_success() {
            return Err(LedgerError::Rpc(format!("{} returned {}", method, status)));
        }

        let envelope: RpcResponse = response.json().await.map_err(transport_error)?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::Rpc(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| LedgerError::Rpc(format!("{}: unexpected result: {}", method, e)))
    }
}

#[async_trait]
impl ChainRpc for JsonRpcChain {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.call("registry_chainId", json!([])).await
    }

    async fn pending_nonce(&self, account: &str) -> Result<u64, LedgerError> {
        self.call("registry_nonce", json!([account, "pending"])).await
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, LedgerError> {
        self.call("registry_sendTransaction", json!([tx])).await
    }

    async fn receipt(&self, tx_ref: &str) -> Result<Option<Receipt>, LedgerError> {
        self.call("registry_getReceipt", json!([tx_ref])).await
    }

    async fn verify(&self, contract: &str, did: &str) -> Result<RegistryEntry, LedgerError> {
        self.call("registry_verify", json!([contract, did])).await
    }

    async fn stats(&self, contract: &str) -> Result<RegistryStats, LedgerError> {
        self.call("registry_stats", json!([contract])).await
    }
}
