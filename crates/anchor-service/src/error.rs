use anchor_crypto::CryptoError;
use anchor_ledger::LedgerError;
use anchor_queue::QueueError;
use anchor_store::StoreError;

/// Identity Service and worker errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("identity generation failed: {0}")]
    Generation(#[from] CryptoError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            internal @ StoreError::Internal(_) => Self::Store(internal),
        }
    }
}
