//! Simulated registry chain for tests and local nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::call::RegistryCall;
use crate::error::LedgerError;
use crate::rpc::ChainRpc;
use crate::transaction::{Receipt, ReceiptStatus, SignedTransaction};
use crate::types::{RegistryEntry, RegistryStats};

#[derive(Debug, Clone)]
struct RegistryRecord {
    user_hash: String,
    revoked: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    block: u64,
    nonces: HashMap<String, u64>,
    receipts: HashMap<String, Receipt>,
    withheld: Vec<Receipt>,
    registry: HashMap<String, RegistryRecord>,
    accepted: Vec<SignedTransaction>,
}

/// An in-process chain with one registry contract.
///
/// Enforces exact nonces and signatures like a real node would, mines each
/// accepted transaction into its own block, and supports failure injection.
pub struct InMemoryChain {
    chain_id: u64,
    contract: String,
    state: Mutex<ChainState>,
    offline: AtomicBool,
    withhold: AtomicBool,
    revert_next: AtomicU32,
    drop_next: AtomicU32,
}

impl InMemoryChain {
    pub fn new(chain_id: u64, contract: impl Into<String>) -> Self {
        Self {
            chain_id,
            contract: contract.into(),
            state: Mutex::new(ChainState::default()),
            offline: AtomicBool::new(false),
            withhold: AtomicBool::new(false),
            revert_next: AtomicU32::new(0),
            drop_next: AtomicU32::new(0),
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Every RPC fails with `ChainUnavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` accepted transactions are mined as reverted.
    pub fn revert_next(&self, n: u32) {
        self.revert_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` transactions are acknowledged with a reference and then
    /// evicted: never mined, no receipt, account nonce unchanged.
    pub fn drop_next(&self, n: u32) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    /// Accept and apply transactions but keep their receipts back.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.withhold.store(withhold, Ordering::SeqCst);
    }

    /// Publish every receipt held back so far.
    pub fn release_receipts(&self) {
        if let Ok(mut state) = self.state.lock() {
            let held = std::mem::take(&mut state.withheld);
            for receipt in held {
                state.receipts.insert(receipt.tx_ref.clone(), receipt);
            }
        }
    }

    /// All transactions the chain accepted, in order.
    pub fn accepted(&self) -> Vec<SignedTransaction> {
        self.state
            .lock()
            .map(|s| s.accepted.clone())
            .unwrap_or_default()
    }

    /// Accepted transactions carrying the given call kind for `did`.
    pub fn submissions_for(&self, kind: &str, did_or_hash: &str) -> usize {
        self.accepted()
            .iter()
            .filter_map(|stx| stx.tx.call().ok())
            .filter(|call| call.name() == kind)
            .filter(|call| match call {
                RegistryCall::Register { did, user_hash, .. }
                | RegistryCall::Update { did, user_hash, .. } => {
                    did == did_or_hash || user_hash == did_or_hash
                }
                RegistryCall::Revoke { user_hash } => user_hash == did_or_hash,
            })
            .count()
    }

    fn online(&self) -> Result<MutexGuard<'_, ChainState>, LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::ChainUnavailable("node offline".into()));
        }
        self.state
            .lock()
            .map_err(|_| LedgerError::Rpc("chain state poisoned".into()))
    }

    fn apply(state: &mut ChainState, call: &RegistryCall) -> Result<(), String> {
        match call {
            RegistryCall::Register { user_hash, did, .. } => {
                if state.registry.contains_key(did) {
                    return Err("DID already registered".into());
                }
                state.registry.insert(
                    did.clone(),
                    RegistryRecord {
                        user_hash: user_hash.clone(),
                        revoked: false,
                    },
                );
            }
            RegistryCall::Update { user_hash, did, .. } => match state.registry.get_mut(did) {
                Some(record) if !record.revoked => record.user_hash = user_hash.clone(),
                Some(_) => return Err("DID revoked".into()),
                None => return Err("DID not registered".into()),
            },
            RegistryCall::Revoke { user_hash } => {
                let record = state
                    .registry
                    .values_mut()
                    .find(|r| r.user_hash == *user_hash && !r.revoked)
                    .ok_or_else(|| "no active DID for user hash".to_string())?;
                record.revoked = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for InMemoryChain {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.online()?;
        Ok(self.chain_id)
    }

    async fn pending_nonce(&self, account: &str) -> Result<u64, LedgerError> {
        Ok(self.online()?.nonces.get(account).copied().unwrap_or(0))
    }

    async fn send_transaction(&self, stx: &SignedTransaction) -> Result<String, LedgerError> {
        let mut state = self.online()?;
        stx.verify()
            .map_err(|e| LedgerError::Rpc(format!("invalid transaction: {}", e)))?;
        if stx.tx.chain_id != self.chain_id {
            return Err(LedgerError::Rpc(format!(
                "wrong chain id {}",
                stx.tx.chain_id
            )));
        }
        let expected = state.nonces.get(&stx.tx.from).copied().unwrap_or(0);
        if stx.tx.nonce != expected {
            return Err(LedgerError::Rpc(format!(
                "nonce mismatch: expected {}, got {}",
                expected, stx.tx.nonce
            )));
        }

        let tx_ref = stx.tx_ref();
        if self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(tx_ref);
        }
        state.nonces.insert(stx.tx.from.clone(), expected + 1);
        state.block += 1;
        state.accepted.push(stx.clone());

        let outcome = if stx.tx.to != self.contract {
            Err("not the registry contract".to_string())
        } else if self
            .revert_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err("injected revert".to_string())
        } else {
            stx.tx
                .call()
                .map_err(|e| e.to_string())
                .and_then(|call| Self::apply(&mut state, &call))
        };

        let receipt = Receipt {
            tx_ref: tx_ref.clone(),
            status: if outcome.is_ok() {
                ReceiptStatus::Success
            } else {
                ReceiptStatus::Reverted
            },
            block_number: state.block,
            reason: outcome.err(),
        };
        if self.withhold.load(Ordering::SeqCst) {
            state.withheld.push(receipt);
        } else {
            state.receipts.insert(tx_ref.clone(), receipt);
        }
        Ok(tx_ref)
    }

    async fn receipt(&self, tx_ref: &str) -> Result<Option<Receipt>, LedgerError> {
        Ok(self.online()?.receipts.get(tx_ref).cloned())
    }

    async fn verify(&self, contract: &str, did: &str) -> Result<RegistryEntry, LedgerError> {
        let state = self.online()?;
        if contract != self.contract {
            return Ok(RegistryEntry::default());
        }
        Ok(match state.registry.get(did) {
            Some(record) => RegistryEntry {
                is_valid: !record.revoked,
                user_hash: Some(record.user_hash.clone()),
            },
            None => RegistryEntry::default(),
        })
    }

    async fn stats(&self, contract: &str) -> Result<RegistryStats, LedgerError> {
        let state = self.online()?;
        if contract != self.contract {
            return Ok(RegistryStats::default());
        }
        let total = state.registry.len() as u64;
        let revoked = state.registry.values().filter(|r| r.revoked).count() as u64;
        Ok(RegistryStats {
            total,
            active: total - revoked,
            revoked,
        })
    }
}
