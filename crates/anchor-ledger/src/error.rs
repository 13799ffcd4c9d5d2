use anchor_crypto::CryptoError;

/// Ledger Client errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("transaction {tx_ref} not confirmed within {waited_ms}ms")]
    TransactionTimeout { tx_ref: String, waited_ms: u64 },

    #[error("transaction {tx_ref} reverted: {reason}")]
    TransactionReverted { tx_ref: String, reason: String },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("submission actor stopped")]
    SubmitterStopped,
}

impl LedgerError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChainUnavailable(_)
                | Self::TransactionTimeout { .. }
                | Self::TransactionReverted { .. }
                | Self::Rpc(_)
        )
    }

    /// The transaction this error is about, when one was broadcast.
    pub fn tx_ref(&self) -> Option<&str> {
        match self {
            Self::TransactionTimeout { tx_ref, .. } | Self::TransactionReverted { tx_ref, .. } => {
                Some(tx_ref)
            }
            _ => None,
        }
    }
}

impl From<CryptoError> for LedgerError {
    fn from(e: CryptoError) -> Self {
        Self::Signing(e.to_string())
    }
}
