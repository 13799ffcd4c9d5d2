//! RocksDB journal backing the job stream.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

use crate::error::QueueError;
use crate::stream::{DeadLetter, StoredMessage};

const CF_MESSAGES: &str = "queue_messages";
/// `<seq>/<consumer>` → empty.
const CF_ACKS: &str = "queue_acks";
/// `<seq>/<consumer>` → dead letter JSON.
const CF_DEAD: &str = "queue_dead";

/// Everything needed to rebuild a stream after a restart.
#[derive(Debug, Default)]
pub(crate) struct JournalState {
    pub messages: Vec<StoredMessage>,
    pub acks: Vec<(u64, String)>,
    pub dead: Vec<DeadLetter>,
}

/// Persistent log of published messages and consumer acknowledgements.
///
/// Delivery counts are not journaled; after a restart unacknowledged messages
/// are delivered again from scratch.
pub struct QueueJournal {
    db: DB,
}

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn consumer_key(seq: u64, consumer: &str) -> Vec<u8> {
    format!("{:020}/{}", seq, consumer).into_bytes()
}

fn parse_consumer_key(key: &[u8]) -> Option<(u64, String)> {
    let key = std::str::from_utf8(key).ok()?;
    let (seq, consumer) = key.split_once('/')?;
    Some((seq.parse().ok()?, consumer.to_string()))
}

impl QueueJournal {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        std::fs::create_dir_all(path)
            .map_err(|e| QueueError::Journal(format!("create {}: {}", path.display(), e)))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = [CF_MESSAGES, CF_ACKS, CF_DEAD]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, QueueError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueueError::Journal(format!("column family '{}' not found", name)))
    }

    pub(crate) fn append(&self, message: &StoredMessage) -> Result<(), QueueError> {
        self.db.put_cf(
            self.cf(CF_MESSAGES)?,
            seq_key(message.seq),
            serde_json::to_vec(message)?,
        )?;
        Ok(())
    }

    pub(crate) fn ack(&self, seq: u64, consumer: &str) -> Result<(), QueueError> {
        self.db
            .put_cf(self.cf(CF_ACKS)?, consumer_key(seq, consumer), b"")?;
        Ok(())
    }

    pub(crate) fn dead_letter(&self, dead: &DeadLetter) -> Result<(), QueueError> {
        self.db.put_cf(
            self.cf(CF_DEAD)?,
            consumer_key(dead.seq, &dead.consumer),
            serde_json::to_vec(dead)?,
        )?;
        Ok(())
    }

    /// Drop a message and every consumer marker that refers to it.
    pub(crate) fn evict(&self, seq: u64) -> Result<(), QueueError> {
        let from = format!("{:020}/", seq);
        let to = format!("{:020}/", seq.saturating_add(1));
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_MESSAGES)?, seq_key(seq));
        batch.delete_range_cf(self.cf(CF_ACKS)?, &from, &to);
        batch.delete_range_cf(self.cf(CF_DEAD)?, &from, &to);
        self.db.write(batch)?;
        Ok(())
    }

    pub(crate) fn load(&self) -> Result<JournalState, QueueError> {
        let mut state = JournalState::default();

        for item in self.db.iterator_cf(self.cf(CF_MESSAGES)?, IteratorMode::Start) {
            let (_, value) = item?;
            state.messages.push(serde_json::from_slice(&value)?);
        }
        for item in self.db.iterator_cf(self.cf(CF_ACKS)?, IteratorMode::Start) {
            let (key, _) = item?;
            match parse_consumer_key(&key) {
                Some(entry) => state.acks.push(entry),
                None => tracing::warn!("skipping malformed ack key in queue journal"),
            }
        }
        for item in self.db.iterator_cf(self.cf(CF_DEAD)?, IteratorMode::Start) {
            let (_, value) = item?;
            state.dead.push(serde_json::from_slice(&value)?);
        }

        Ok(state)
    }
}
