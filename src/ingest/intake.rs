//! Admission queue shared by producers and upload workers
//!
//! Chunks are queued in arrival order across all channels, with a bounded
//! number of queued chunks per channel. Sequence numbers are assigned in
//! that order when a worker takes chunks, so discarded chunks never leave
//! holes in the sequence.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::chunk::{Annotation, Chunk};
use super::config::DropPolicy;
use crate::error::IngestError;

struct Queued {
    channel: String,
    data: Bytes,
    captured_at: DateTime<Utc>,
}

#[derive(Default)]
struct ChannelState {
    queued: usize,
    senders: usize,
    policy: DropPolicy,
}

#[derive(Default)]
struct IntakeState {
    queue: VecDeque<Queued>,
    channels: HashMap<String, ChannelState>,
    annotations: BTreeMap<String, Annotation>,
    next_seq: u64,
    producers: usize,
    sealed: bool,
    closed: bool,
    dropped: u64,
}

impl IntakeState {
    fn finished(&self) -> bool {
        self.closed || (self.sealed && self.producers == 0)
    }

    /// Discard the oldest queued chunk of `channel`
    fn drop_oldest(&mut self, channel: &str) -> Option<u64> {
        let pos = self.queue.iter().position(|q| q.channel == channel)?;
        let victim = self.queue.remove(pos)?;
        let len = victim.data.len() as u64;

        if let Some(ch) = self.channels.get_mut(channel) {
            ch.queued = ch.queued.saturating_sub(1);
        }
        self.annotations
            .entry(channel.to_string())
            .or_default()
            .note_drop(len, victim.captured_at);
        self.dropped += 1;
        Some(len)
    }
}

/// What a worker finds when it polls the intake
#[derive(Debug)]
pub enum Work {
    Batch(Vec<Chunk>),
    Idle,
    Finished,
}

/// Admission queue
pub struct Intake {
    state: Mutex<IntakeState>,
    capacity: usize,
    space: Notify,
    ready: Notify,
    closed_tx: watch::Sender<bool>,
}

impl Intake {
    pub fn new(capacity: usize) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(IntakeState::default()),
            capacity: capacity.max(1),
            space: Notify::new(),
            ready: Notify::new(),
            closed_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IntakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a producer on `channel`
    pub fn sender(self: &Arc<Self>, channel: &str, policy: DropPolicy) -> ChannelSender {
        {
            let mut state = self.lock();
            let ch = state.channels.entry(channel.to_string()).or_default();
            ch.senders += 1;
            ch.policy = policy;
            state.producers += 1;
        }
        ChannelSender {
            intake: Arc::clone(self),
            channel: channel.to_string(),
        }
    }

    fn unregister(&self, channel: &str) {
        let finished = {
            let mut state = self.lock();
            if let Some(ch) = state.channels.get_mut(channel) {
                ch.senders = ch.senders.saturating_sub(1);
            }
            state.producers = state.producers.saturating_sub(1);
            state.finished()
        };
        if finished {
            self.ready.notify_waiters();
        }
    }

    /// No further producers will register
    pub fn seal(&self) {
        let finished = {
            let mut state = self.lock();
            state.sealed = true;
            state.finished()
        };
        if finished {
            self.ready.notify_waiters();
        }
    }

    /// Stop admitting chunks; queued chunks are still handed to workers
    pub fn close(&self) {
        self.lock().closed = true;
        self.closed_tx.send_replace(true);
        self.space.notify_waiters();
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once the intake is closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Closed, or sealed with every producer gone
    pub fn is_finished(&self) -> bool {
        self.lock().finished()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Chunks discarded by the drop-oldest policy so far
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Queue a chunk, applying the channel's policy when its queue is full
    pub async fn admit(
        &self,
        channel: &str,
        data: Bytes,
        captured_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let started = Instant::now();

        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let policy = {
                let mut state = self.lock();
                if state.closed {
                    return Err(IngestError::Closed);
                }

                let capacity = self.capacity;
                let ch = state.channels.entry(channel.to_string()).or_default();
                let policy = ch.policy;
                let full = ch.queued >= capacity;

                let admit = if !full {
                    true
                } else if let DropPolicy::DropOldest { after } = policy {
                    if started.elapsed() >= after {
                        if let Some(len) = state.drop_oldest(channel) {
                            warn!(channel, bytes = len, "Queue full, dropped oldest chunk");
                        }
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };

                if admit {
                    if let Some(ch) = state.channels.get_mut(channel) {
                        ch.queued += 1;
                    }
                    state.queue.push_back(Queued {
                        channel: channel.to_string(),
                        data: data.clone(),
                        captured_at,
                    });
                    drop(state);
                    self.ready.notify_one();
                    return Ok(());
                }
                policy
            };

            match policy {
                DropPolicy::Block => notified.await,
                DropPolicy::DropOldest { after } => {
                    let remaining = after.saturating_sub(started.elapsed());
                    let _ = tokio::time::timeout(remaining, notified).await;
                }
            }
        }
    }

    /// Take up to `max` chunks, numbering them in admission order
    pub fn poll_work(&self, max: usize) -> Work {
        let mut state = self.lock();
        if state.queue.is_empty() {
            return if state.finished() {
                Work::Finished
            } else {
                Work::Idle
            };
        }

        let n = max.max(1).min(state.queue.len());
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(q) = state.queue.pop_front() else {
                break;
            };
            if let Some(ch) = state.channels.get_mut(&q.channel) {
                ch.queued = ch.queued.saturating_sub(1);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            batch.push(Chunk {
                seq,
                channel: q.channel,
                data: q.data,
                captured_at: q.captured_at,
            });
        }
        drop(state);

        self.space.notify_waiters();
        Work::Batch(batch)
    }

    /// Wake-up for workers; enable it before polling to avoid missed signals
    pub(crate) fn work_notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    /// Note a failure on a channel for the next leaf
    pub fn note_failure(&self, channel: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(channel, reason = %reason, "Recording channel failure");
        self.lock()
            .annotations
            .entry(channel.to_string())
            .or_default()
            .failures
            .push(reason);
    }

    pub fn has_annotations(&self) -> bool {
        self.lock().annotations.values().any(|a| !a.is_empty())
    }

    /// Take every pending annotation
    pub fn take_annotations(&self) -> BTreeMap<String, Annotation> {
        std::mem::take(&mut self.lock().annotations)
    }
}

/// Producer-side handle for one channel
///
/// Dropping the sender unregisters the producer.
pub struct ChannelSender {
    intake: Arc<Intake>,
    channel: String,
}

impl ChannelSender {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Admit a chunk captured now
    pub async fn send(&self, data: Bytes) -> Result<(), IngestError> {
        self.send_at(data, Utc::now()).await
    }

    /// Admit a chunk with an explicit capture instant
    pub async fn send_at(&self, data: Bytes, captured_at: DateTime<Utc>) -> Result<(), IngestError> {
        if data.is_empty() {
            return Ok(());
        }
        self.intake.admit(&self.channel, data, captured_at).await
    }

    /// Record that the channel's source failed
    pub fn record_failure(&self, reason: impl Into<String>) {
        self.intake.note_failure(&self.channel, reason);
    }

    /// Resolves once the pipeline stops admitting chunks
    pub async fn closed(&self) {
        self.intake.closed().await;
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        self.intake.unregister(&self.channel);
    }
}
