//! At-least-once hand-off of Blockchain Jobs to asynchronous drivers.
//!
//! [`JobStream`] keeps an append-only, retention-bounded log. Each durable
//! consumer tracks its own acknowledgements; a negative acknowledgement
//! schedules redelivery until the delivery limit, after which the message is
//! dead-lettered. A [`QueueJournal`] makes the log survive restarts.

pub mod error;
pub mod journal;
pub mod message;
pub mod stream;
pub mod transport;

pub use error::{HandlerError, QueueError};
pub use journal::QueueJournal;
pub use message::{subject_for, JobMessage, SUBJECT_PREFIX};
pub use stream::{DeadLetter, JobStream, StreamConfig, StreamInfo};
pub use transport::{JobHandler, QueueTransport, Subscription};
