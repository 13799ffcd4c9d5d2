//! Client for the external DID registry.
//!
//! Writes go through a single submission actor that owns the signing
//! account's nonce, so at most one write transaction is in flight per
//! account. Reads are plain calls against the [`ChainRpc`] seam.

pub mod call;
pub mod client;
pub mod error;
pub mod json_rpc;
pub mod memory;
pub mod rpc;
pub mod submitter;
pub mod transaction;
pub mod types;

pub use call::RegistryCall;
pub use client::{LedgerClient, LedgerClientConfig};
pub use error::LedgerError;
pub use json_rpc::JsonRpcChain;
pub use memory::InMemoryChain;
pub use rpc::ChainRpc;
pub use transaction::{ChainTransaction, Receipt, ReceiptStatus, SignedTransaction, TxStatus};
pub use types::{RegistryEntry, RegistryStats};
