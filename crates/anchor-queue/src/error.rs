/// Queue Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("journal error: {0}")]
    Journal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown message sequence {0}")]
    UnknownSequence(u64),

    #[error("queue state lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for QueueError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Journal(e.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Returned by a handler to negatively acknowledge a message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);
