use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anchor_core::{BlockchainJob, JobType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::QueueError;
use crate::journal::QueueJournal;
use crate::message::{subject_for, JobMessage};
use crate::transport::{JobHandler, QueueTransport, Subscription};

/// Stream limits and consumer policy.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    /// Messages older than this are evicted.
    pub max_age: Duration,
    /// The oldest messages are evicted beyond this count.
    pub max_messages: usize,
    /// Deliveries per consumer before a message is dead-lettered.
    pub max_deliver: u32,
    /// Redelivery delay after a negative acknowledgement.
    pub nak_delay: Duration,
    /// Durable consumer names are `<consumer_name>-<job type>`.
    pub consumer_name: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "BLOCKCHAIN_JOBS".into(),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_messages: 10_000,
            max_deliver: 3,
            nak_delay: Duration::from_secs(1),
            consumer_name: "did-manager-worker".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    pub message: JobMessage,
    pub published_at: DateTime<Utc>,
}

/// A message a consumer gave up on after `max_deliver` attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub seq: u64,
    pub consumer: String,
    pub message: JobMessage,
    pub deliveries: u32,
    pub error: String,
    pub dead_at: DateTime<Utc>,
}

/// Point-in-time view of the stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub messages: usize,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    pub dead_letters: usize,
}

#[derive(Debug, Default)]
struct ConsumerState {
    acked: HashSet<u64>,
    dead: HashSet<u64>,
    in_flight: HashSet<u64>,
    deliveries: HashMap<u64, u32>,
    not_before: HashMap<u64, Instant>,
}

impl ConsumerState {
    fn forget(&mut self, seq: u64) {
        self.acked.remove(&seq);
        self.dead.remove(&seq);
        self.in_flight.remove(&seq);
        self.deliveries.remove(&seq);
        self.not_before.remove(&seq);
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    log: BTreeMap<u64, StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
    dead_letters: Vec<DeadLetter>,
}

pub(crate) struct Delivery {
    pub seq: u64,
    pub message: JobMessage,
    pub attempt: u32,
}

pub(crate) enum Next {
    Deliver(Delivery),
    /// Nothing ready; the earliest delayed redelivery is this far away.
    Wait(Option<Duration>),
}

struct Shared {
    config: StreamConfig,
    inner: Mutex<Inner>,
    journal: Option<QueueJournal>,
    wake: watch::Sender<u64>,
}

/// Durable, bounded, at-least-once job stream.
///
/// Cloning is cheap; clones share the same log.
#[derive(Clone)]
pub struct JobStream {
    shared: Arc<Shared>,
}

impl JobStream {
    /// A stream that lives only in memory.
    pub fn in_memory(config: StreamConfig) -> Self {
        Self::build(config, None, Inner {
            next_seq: 1,
            ..Inner::default()
        })
    }

    /// A stream backed by a journal, replaying whatever it holds.
    pub fn open(config: StreamConfig, journal: QueueJournal) -> Result<Self, QueueError> {
        let state = journal.load()?;
        let mut inner = Inner {
            next_seq: 1,
            ..Inner::default()
        };
        for stored in state.messages {
            inner.next_seq = inner.next_seq.max(stored.seq + 1);
            inner.log.insert(stored.seq, stored);
        }
        for (seq, consumer) in state.acks {
            inner.consumers.entry(consumer).or_default().acked.insert(seq);
        }
        for dead in state.dead {
            inner
                .consumers
                .entry(dead.consumer.clone())
                .or_default()
                .dead
                .insert(dead.seq);
            inner.dead_letters.push(dead);
        }

        tracing::info!(
            stream = %config.name,
            messages = inner.log.len(),
            next_seq = inner.next_seq,
            "replayed queue journal"
        );

        let stream = Self::build(config, Some(journal), inner);
        {
            let mut inner = stream.lock()?;
            stream.evict(&mut inner)?;
        }
        Ok(stream)
    }

    fn build(config: StreamConfig, journal: Option<QueueJournal>, inner: Inner) -> Self {
        let (wake, _) = watch::channel(inner.next_seq.saturating_sub(1));
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(inner),
                journal,
                wake,
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn consumer_for(&self, job_type: JobType) -> String {
        format!("{}-{}", self.shared.config.consumer_name, job_type)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.shared.inner.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Drop messages beyond the age and count limits, oldest first.
    fn evict(&self, inner: &mut Inner) -> Result<(), QueueError> {
        let config = &self.shared.config;
        let now = Utc::now();
        while let Some((&seq, oldest)) = inner.log.first_key_value() {
            let too_old = (now - oldest.published_at)
                .to_std()
                .is_ok_and(|age| age > config.max_age);
            let too_many = inner.log.len() > config.max_messages;
            if !too_old && !too_many {
                break;
            }
            inner.log.remove(&seq);
            for state in inner.consumers.values_mut() {
                state.forget(seq);
            }
            inner.dead_letters.retain(|d| d.seq != seq);
            if let Some(journal) = &self.shared.journal {
                journal.evict(seq)?;
            }
            tracing::debug!(stream = %config.name, seq, "evicted message");
        }
        Ok(())
    }

    /// Append a job message to the log and wake subscribers.
    pub fn publish_message(&self, message: JobMessage) -> Result<u64, QueueError> {
        let seq = {
            let mut inner = self.lock()?;
            let seq = inner.next_seq;
            let stored = StoredMessage {
                seq,
                subject: message.subject(),
                message,
                published_at: Utc::now(),
            };
            if let Some(journal) = &self.shared.journal {
                journal.append(&stored)?;
            }
            inner.next_seq += 1;
            inner.log.insert(seq, stored);
            self.evict(&mut inner)?;
            seq
        };
        self.shared.wake.send_replace(seq);
        Ok(seq)
    }

    /// Pick the next message for a consumer and mark it in flight.
    pub(crate) fn next_delivery(&self, consumer: &str, subject: &str) -> Result<Next, QueueError> {
        let mut guard = self.lock()?;
        self.evict(&mut guard)?;

        let now = Instant::now();
        let Inner { log, consumers, .. } = &mut *guard;
        let state = consumers.entry(consumer.to_string()).or_default();
        let mut soonest: Option<Duration> = None;

        for (seq, stored) in log.iter() {
            if stored.subject != subject
                || state.acked.contains(seq)
                || state.dead.contains(seq)
                || state.in_flight.contains(seq)
            {
                continue;
            }
            if let Some(at) = state.not_before.get(seq) {
                if *at > now {
                    let wait = *at - now;
                    soonest = Some(soonest.map_or(wait, |s| s.min(wait)));
                    continue;
                }
            }
            let attempt = state.deliveries.entry(*seq).or_insert(0);
            *attempt += 1;
            state.in_flight.insert(*seq);
            state.not_before.remove(seq);
            return Ok(Next::Deliver(Delivery {
                seq: *seq,
                message: stored.message.clone(),
                attempt: *attempt,
            }));
        }

        Ok(Next::Wait(soonest))
    }

    pub(crate) fn ack(&self, consumer: &str, seq: u64) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        if !inner.log.contains_key(&seq) {
            // Evicted while in flight.
            return Err(QueueError::UnknownSequence(seq));
        }
        let state = inner.consumers.entry(consumer.to_string()).or_default();
        state.in_flight.remove(&seq);
        state.deliveries.remove(&seq);
        state.not_before.remove(&seq);
        state.acked.insert(seq);
        if let Some(journal) = &self.shared.journal {
            journal.ack(seq, consumer)?;
        }
        Ok(())
    }

    /// Negative acknowledgement: schedule redelivery, or dead-letter the
    /// message once the delivery limit is reached.
    pub(crate) fn nak(&self, consumer: &str, seq: u64, error: &str) -> Result<(), QueueError> {
        let config = &self.shared.config;
        let mut guard = self.lock()?;
        let Inner {
            log,
            consumers,
            dead_letters,
            ..
        } = &mut *guard;
        let stored = log.get(&seq).ok_or(QueueError::UnknownSequence(seq))?;
        let state = consumers.entry(consumer.to_string()).or_default();
        state.in_flight.remove(&seq);
        let deliveries = state.deliveries.get(&seq).copied().unwrap_or(1);

        if deliveries >= config.max_deliver {
            state.deliveries.remove(&seq);
            state.not_before.remove(&seq);
            state.dead.insert(seq);
            let dead = DeadLetter {
                seq,
                consumer: consumer.to_string(),
                message: stored.message.clone(),
                deliveries,
                error: error.to_string(),
                dead_at: Utc::now(),
            };
            if let Some(journal) = &self.shared.journal {
                journal.dead_letter(&dead)?;
            }
            tracing::warn!(
                consumer,
                seq,
                job_id = %dead.message.job_id,
                deliveries,
                error,
                "message dead-lettered"
            );
            dead_letters.push(dead);
        } else {
            state
                .not_before
                .insert(seq, Instant::now() + config.nak_delay);
            tracing::debug!(consumer, seq, deliveries, "message nak'd, redelivery scheduled");
        }
        Ok(())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.lock()?.dead_letters.clone())
    }

    pub fn info(&self) -> Result<StreamInfo, QueueError> {
        let inner = self.lock()?;
        Ok(StreamInfo {
            name: self.shared.config.name.clone(),
            messages: inner.log.len(),
            first_seq: inner.log.keys().next().copied(),
            last_seq: inner.log.keys().next_back().copied(),
            dead_letters: inner.dead_letters.len(),
        })
    }

    /// Messages the consumer has not acknowledged or dead-lettered.
    pub fn pending_for(&self, consumer: &str, job_type: JobType) -> Result<usize, QueueError> {
        let subject = subject_for(job_type);
        let inner = self.lock()?;
        let state = inner.consumers.get(consumer);
        Ok(inner
            .log
            .iter()
            .filter(|entry| {
                let (seq, m) = *entry;
                m.subject == subject
                    && state.map_or(true, |s| !s.acked.contains(seq) && !s.dead.contains(seq))
            })
            .count())
    }
}

async fn run_consumer(
    stream: JobStream,
    consumer: String,
    subject: String,
    handler: Arc<dyn JobHandler>,
    mut wake: watch::Receiver<u64>,
) {
    tracing::info!(consumer = %consumer, subject = %subject, "consumer started");
    loop {
        wake.borrow_and_update();
        match stream.next_delivery(&consumer, &subject) {
            Ok(Next::Deliver(delivery)) => {
                tracing::debug!(
                    consumer = %consumer,
                    seq = delivery.seq,
                    attempt = delivery.attempt,
                    job_id = %delivery.message.job_id,
                    "delivering message"
                );
                let settled = match handler.handle(&delivery.message).await {
                    Ok(()) => stream.ack(&consumer, delivery.seq),
                    Err(e) => stream.nak(&consumer, delivery.seq, &e.to_string()),
                };
                if let Err(e) = settled {
                    tracing::warn!(consumer = %consumer, seq = delivery.seq, error = %e, "failed to settle message");
                }
            }
            Ok(Next::Wait(Some(delay))) => {
                tokio::select! {
                    _ = wake.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(Next::Wait(None)) => {
                if wake.changed().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(consumer = %consumer, error = %e, "queue read failed");
                tokio::time::sleep(stream.config().nak_delay).await;
            }
        }
    }
}

#[async_trait]
impl QueueTransport for JobStream {
    async fn publish(&self, job: &BlockchainJob) -> Result<(), QueueError> {
        let seq = self.publish_message(JobMessage::from_job(job))?;
        tracing::debug!(
            job_id = %job.id,
            subject = %subject_for(job.job_type),
            seq,
            "published job"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Subscription, QueueError> {
        let consumer = self.consumer_for(job_type);
        let subject = subject_for(job_type);
        let wake = self.shared.wake.subscribe();
        let handle = tokio::spawn(run_consumer(
            self.clone(),
            consumer.clone(),
            subject,
            handler,
            wake,
        ));
        Ok(Subscription::new(consumer, handle))
    }
}
