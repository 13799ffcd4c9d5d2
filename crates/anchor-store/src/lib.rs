//! Durable storage for Identity Records and Blockchain Jobs.
//!
//! Two backends implement both [`IdentityStore`] and [`JobLedger`]:
//! [`MemoryStore`] (DashMap, for tests and ephemeral nodes) and
//! [`RocksStore`] (column families in one RocksDB instance).

pub mod error;
pub mod memory;
pub mod rocks;
pub mod traits;
mod transitions;

#[cfg(test)]
mod conformance;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use rocks::RocksStore;
pub use traits::{IdentityStore, JobLedger};
