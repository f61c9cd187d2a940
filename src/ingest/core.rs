//! Ingest pipeline: producers in, ordered index commits out

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::blocks::BlockTracker;
use super::chunk::{Annotation, Upload};
use super::commit::commit_batch;
use super::config::{DropPolicy, IngestConfig};
use super::intake::{ChannelSender, Intake};
use super::pool::{PoolCounters, WorkerPool};
use super::reorder::ReorderBuffer;
use crate::error::IngestError;
use crate::index::{ChainIndex, LeafPayload};
use crate::locator::{Locator, LocatorSink};
use crate::traits::{BlockRef, LedgerClient, Producer};

/// Totals reported when the pipeline stops
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    /// Leaves appended to the index
    pub batches: u64,
    pub chunks: u64,
    pub bytes: u64,
    /// Chunks whose upload failed for good
    pub failed_uploads: u64,
    /// Chunks discarded by drop-oldest channels
    pub dropped: u64,
    pub peak_workers: usize,
    /// Last locator persisted
    pub locator: Option<Locator>,
}

/// Ingest pipeline before it is started
pub struct IngestPipeline {
    ledger: Arc<dyn LedgerClient>,
    index: ChainIndex,
    config: IngestConfig,
    sink: Option<LocatorSink>,
}

impl IngestPipeline {
    pub fn new(ledger: Arc<dyn LedgerClient>, index: ChainIndex, config: IngestConfig) -> Self {
        Self {
            ledger,
            index,
            config: config.normalized(),
            sink: None,
        }
    }

    /// Write every new locator through `sink`
    pub fn with_sink(mut self, sink: LocatorSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start workers and the index consumer
    ///
    /// A message on `shutdown` (or dropping its sender) stops admission;
    /// queued chunks are still uploaded and committed before the task
    /// resolves. Without a shutdown the task resolves once every handle and
    /// channel sender has been dropped and the backlog is drained.
    pub fn start(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> (
        IngestHandle,
        JoinHandle<Result<IngestSummary, IngestError>>,
    ) {
        let intake = Arc::new(Intake::new(self.config.channel_capacity));
        let (pool, results) = WorkerPool::start(
            Arc::clone(&intake),
            Arc::clone(&self.ledger),
            self.config.clone(),
            self.index.session(),
        );
        let counters = pool.counters();
        let (locators, locator_rx) = watch::channel(self.index.locator().cloned());

        info!(
            session = %self.index.session(),
            degree = self.index.degree(),
            primary = %self.config.primary_channel,
            max_workers = self.config.max_workers,
            "Ingest pipeline started"
        );

        let consumer = Consumer {
            ledger: self.ledger,
            index: self.index,
            config: self.config.clone(),
            sink: self.sink,
            intake: Arc::clone(&intake),
            reorder: ReorderBuffer::new(0),
            locators,
            counters: Arc::clone(&counters),
            summary: IngestSummary::default(),
        };
        let task = tokio::spawn(consumer.run(results, shutdown));

        let handle = IngestHandle {
            inner: Arc::new(HandleInner {
                intake,
                default_policy: self.config.drop_policy,
                counters,
                locator_rx,
            }),
        };
        (handle, task)
    }
}

struct HandleInner {
    intake: Arc<Intake>,
    default_policy: DropPolicy,
    counters: Arc<PoolCounters>,
    locator_rx: watch::Receiver<Option<Locator>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.intake.seal();
    }
}

/// Producer-facing side of a running pipeline
///
/// Channels can be opened while any clone of the handle is alive. Once the
/// last clone is dropped the pipeline finishes after its open channels do.
#[derive(Clone)]
pub struct IngestHandle {
    inner: Arc<HandleInner>,
}

impl IngestHandle {
    /// Open a channel with the pipeline's default drop policy
    pub fn channel(&self, name: &str) -> ChannelSender {
        self.channel_with_policy(name, self.inner.default_policy)
    }

    pub fn channel_with_policy(&self, name: &str, policy: DropPolicy) -> ChannelSender {
        self.inner.intake.sender(name, policy)
    }

    /// Drive a producer on its own task until it ends, fails, or the pipeline closes
    pub fn spawn_producer(&self, producer: Box<dyn Producer>) -> JoinHandle<()> {
        let sender = self.channel(producer.channel());
        tokio::spawn(run_producer(producer, sender))
    }

    /// Stop admitting chunks; same effect as the shutdown signal
    pub fn shutdown(&self) {
        self.inner.intake.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.intake.is_closed()
    }

    pub fn queued(&self) -> usize {
        self.inner.intake.queued()
    }

    pub fn workers(&self) -> Arc<PoolCounters> {
        Arc::clone(&self.inner.counters)
    }

    /// Follows every locator the pipeline persists
    pub fn locator_watch(&self) -> watch::Receiver<Option<Locator>> {
        self.inner.locator_rx.clone()
    }
}

async fn run_producer(mut producer: Box<dyn Producer>, sender: ChannelSender) {
    let channel = sender.channel().to_string();
    let mut chunks = 0u64;

    loop {
        let next = tokio::select! {
            _ = sender.closed() => {
                debug!(channel = %channel, "Pipeline closed, stopping producer");
                break;
            }
            next = producer.next_chunk() => next,
        };

        match next {
            Ok(Some(data)) => {
                if sender.send(data).await.is_err() {
                    break;
                }
                chunks += 1;
            }
            Ok(None) => {
                info!(channel = %channel, chunks, "Producer finished");
                break;
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "Producer failed");
                sender.record_failure(e.to_string());
                break;
            }
        }
    }
}

/// Single owner of the chain index
struct Consumer {
    ledger: Arc<dyn LedgerClient>,
    index: ChainIndex,
    config: IngestConfig,
    sink: Option<LocatorSink>,
    intake: Arc<Intake>,
    reorder: ReorderBuffer<Upload>,
    locators: watch::Sender<Option<Locator>>,
    counters: Arc<PoolCounters>,
    summary: IngestSummary,
}

impl Consumer {
    async fn run(
        mut self,
        mut results: mpsc::Receiver<Upload>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<IngestSummary, IngestError> {
        let mut tracker = match BlockTracker::start(Arc::clone(&self.ledger)).await {
            Ok(tracker) => tracker,
            Err(e) => {
                error!(error = %e, "Cannot read the ledger tip, aborting capture");
                self.intake.close();
                return Err(IngestError::Ledger(e));
            }
        };

        let period = Duration::from_secs(self.config.block_refresh_secs);
        let mut refresh = interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_seen = false;

        loop {
            tokio::select! {
                _ = shutdown.recv(), if !shutdown_seen => {
                    shutdown_seen = true;
                    info!(queued = self.intake.queued(), "Shutdown requested, draining backlog");
                    self.intake.close();
                }

                _ = refresh.tick() => {
                    tracker.refresh().await;
                }

                upload = results.recv() => match upload {
                    Some(upload) => {
                        self.accept(upload);
                        while let Ok(upload) = results.try_recv() {
                            self.accept(upload);
                        }
                        if let Err(e) = self.drain(tracker.current()).await {
                            self.intake.close();
                            return Err(e);
                        }
                    }
                    None => break,
                }
            }
        }

        self.finish(tracker.current()).await
    }

    fn accept(&mut self, upload: Upload) {
        let seq = upload.seq;
        if !self.reorder.insert(seq, upload) {
            warn!(seq, "Ignoring duplicate upload result");
        }
    }

    /// Commit every contiguous run of results that is ready
    async fn drain(&mut self, floor: &BlockRef) -> Result<(), IngestError> {
        let mut ready = Vec::new();
        while let Some(upload) = self.reorder.pop_ready() {
            ready.push(upload);
        }

        let mut ready = ready.into_iter().peekable();
        while ready.peek().is_some() {
            let mut batch = Vec::new();
            let mut bytes = 0u64;
            while let Some(next) = ready.peek() {
                let full = batch.len() >= self.config.max_batch_items
                    || (!batch.is_empty() && bytes + next.len > self.config.max_batch_bytes);
                if full {
                    break;
                }
                bytes += next.len;
                if let Some(upload) = ready.next() {
                    batch.push(upload);
                }
            }
            self.commit(batch, floor).await?;
        }
        Ok(())
    }

    /// Build one leaf from `uploads` plus pending annotations and commit it
    async fn commit(&mut self, uploads: Vec<Upload>, floor: &BlockRef) -> Result<(), IngestError> {
        let mut payload = LeafPayload::new(floor.clone());
        let mut notes: BTreeMap<String, Annotation> = BTreeMap::new();
        let first_seq = uploads.first().map(|u| u.seq);
        let mut chunks = 0u64;

        for upload in uploads {
            match upload.outcome {
                Ok(record) => {
                    payload.min_block = payload.min_block.earliest(record.block);
                    payload
                        .channels
                        .entry(upload.channel)
                        .or_default()
                        .push(record.id, upload.captured_at, upload.len);
                    chunks += 1;
                }
                Err(source) => {
                    warn!(seq = upload.seq, channel = %upload.channel, error = %source, "Chunk lost after upload failure");
                    let note = notes.entry(upload.channel).or_default();
                    note.note_drop(upload.len, upload.captured_at);
                    note.failures.push(
                        IngestError::Upload {
                            seq: upload.seq,
                            source,
                        }
                        .to_string(),
                    );
                    self.summary.failed_uploads += 1;
                }
            }
        }

        for (channel, note) in self.intake.take_annotations() {
            notes.entry(channel).or_default().merge(note);
        }
        attach_notes(&mut payload, notes);

        if payload.channels.is_empty() {
            return Ok(());
        }

        let size = payload.channel_len(&self.config.primary_channel);
        let snapshot_block = payload.min_block.clone();
        let locator = commit_batch(
            &mut self.index,
            size,
            payload,
            &snapshot_block,
            &self.config,
        )
        .await?;

        self.summary.batches += 1;
        self.summary.chunks += chunks;
        self.summary.bytes += size;
        info!(
            first_seq,
            chunks,
            size,
            leaves = locator.leaves,
            total = locator.size,
            frontier = self.index.frontier().len(),
            "Committed batch"
        );

        self.publish(locator).await;
        Ok(())
    }

    async fn publish(&mut self, locator: Locator) {
        if let Some(mut sink) = self.sink.take() {
            let written = locator.clone();
            match tokio::task::spawn_blocking(move || {
                let result = sink.write(&written);
                (sink, result)
            })
            .await
            {
                Ok((sink, result)) => {
                    self.sink = Some(sink);
                    match result {
                        Ok(path) => debug!(path = %path.display(), "Locator written"),
                        Err(e) => warn!(error = %e, "Failed to write locator file, will retry on next batch"),
                    }
                }
                Err(e) => error!(error = %e, "Locator writer panicked, no longer writing locator files"),
            }
        }
        self.summary.locator = Some(locator.clone());
        self.locators.send_replace(Some(locator));
    }

    async fn finish(mut self, floor: &BlockRef) -> Result<IngestSummary, IngestError> {
        if !self.reorder.is_empty() {
            error!(
                expected = self.reorder.next_seq(),
                stranded = self.reorder.len(),
                "Upload results ended with a sequence gap"
            );
            return Err(IngestError::SequenceGap {
                expected: self.reorder.next_seq(),
                pending: self.reorder.len(),
            });
        }

        if self.intake.has_annotations() {
            debug!("Committing trailing annotations");
            self.commit(Vec::new(), floor).await?;
        }

        self.summary.dropped = self.intake.dropped();
        self.summary.peak_workers = self.counters.peak();
        if self.summary.locator.is_none() {
            self.summary.locator = self.index.locator().cloned();
        }

        info!(
            batches = self.summary.batches,
            chunks = self.summary.chunks,
            bytes = self.summary.bytes,
            failed = self.summary.failed_uploads,
            dropped = self.summary.dropped,
            "Ingest pipeline stopped"
        );
        Ok(self.summary)
    }
}

/// Fold drop markers and failure notes into the leaf's channel entries
fn attach_notes(payload: &mut LeafPayload, notes: BTreeMap<String, Annotation>) {
    for (channel, note) in notes {
        if note.is_empty() {
            continue;
        }
        let entry = payload.channels.entry(channel).or_default();
        if let Some(marker) = note.dropped.clone() {
            match entry.dropped.as_mut() {
                Some(existing) => existing.merge(marker),
                None => entry.dropped = Some(marker),
            }
        }
        if let Some(text) = note.failure_text() {
            entry.failure = Some(match entry.failure.take() {
                Some(prev) => format!("{prev}; {text}"),
                None => text,
            });
        }
    }
}

/// Send `data` on a fresh channel and close it
pub async fn send_all(
    handle: &IngestHandle,
    channel: &str,
    chunks: impl IntoIterator<Item = Bytes>,
) -> Result<(), IngestError> {
    let sender = handle.channel(channel);
    for chunk in chunks {
        sender.send(chunk).await?;
    }
    Ok(())
}
