use anchor_crypto::{hash_hex, sign, verify, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::call::RegistryCall;
use crate::error::LedgerError;

/// An unsigned registry transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    /// Hex public key of the signing account.
    pub from: String,
    /// Registry contract address.
    pub to: String,
    /// `0x`-prefixed hex call data.
    pub data: String,
}

impl ChainTransaction {
    pub fn new(chain_id: u64, nonce: u64, from: &str, to: &str, call: &RegistryCall) -> Result<Self, LedgerError> {
        Ok(Self {
            chain_id,
            nonce,
            from: from.to_string(),
            to: to.to_string(),
            data: format!("0x{}", hex::encode(call.encode()?)),
        })
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}",
            self.chain_id, self.nonce, self.from, self.to, self.data
        )
        .into_bytes()
    }

    pub fn call(&self) -> Result<RegistryCall, LedgerError> {
        let raw = hex::decode(self.data.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Encoding(format!("call data is not hex: {}", e)))?;
        RegistryCall::decode(&raw)
    }
}

/// A transaction with its Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub tx: ChainTransaction,
    pub signature: String,
}

impl SignedTransaction {
    pub fn sign(tx: ChainTransaction, keypair: &KeyPair) -> Self {
        let signature = sign(keypair, &tx.signing_bytes()).to_hex();
        Self { tx, signature }
    }

    /// Check the signature against the `from` account.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let key = PublicKey::from_hex(&self.tx.from)?;
        let signature = Signature::from_hex(&self.signature)?;
        verify(&key, &self.tx.signing_bytes(), &signature)?;
        Ok(())
    }

    /// Transaction reference: `0x` + BLAKE3 of the signed payload.
    pub fn tx_ref(&self) -> String {
        let mut payload = self.tx.signing_bytes();
        payload.extend_from_slice(self.signature.as_bytes());
        format!("0x{}", hash_hex(&payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// Proof that a transaction was included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_ref: String,
    pub status: ReceiptStatus,
    pub block_number: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What the chain knows about a previously broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed { block_number: u64 },
    Reverted { reason: String },
    /// Not (yet) included.
    Unknown,
}

impl From<Option<Receipt>> for TxStatus {
    fn from(receipt: Option<Receipt>) -> Self {
        match receipt {
            Some(r) if r.status == ReceiptStatus::Success => Self::Confirmed {
                block_number: r.block_number,
            },
            Some(r) => Self::Reverted {
                reason: r.reason.unwrap_or_else(|| "reverted".into()),
            },
            None => Self::Unknown,
        }
    }
}
