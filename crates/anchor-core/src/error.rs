/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid DID transition from {from} on {event}")]
    InvalidDidTransition { from: String, event: String },

    #[error("invalid job transition from {from} on {event}")]
    InvalidJobTransition { from: String, event: String },

    #[error("unknown DID status: {0}")]
    UnknownDidStatus(String),

    #[error("unknown job status: {0}")]
    UnknownJobStatus(String),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid DID format: {0}")]
    InvalidDid(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}
