//! Upload worker pool
//!
//! Workers take small runs of consecutive chunks from the intake, upload
//! them concurrently and release the results in sequence order. The pool
//! grows while the queue outpaces it and shrinks back to `min_workers`
//! once the queue drains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesOrdered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::chunk::{Chunk, Upload};
use super::config::IngestConfig;
use super::intake::{Intake, Work};
use crate::ledger::put_idempotent;
use crate::traits::{LedgerClient, Tag};

/// Live pool counters
#[derive(Debug, Default)]
pub struct PoolCounters {
    active: AtomicUsize,
    spawned: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolCounters {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers started over the pool's lifetime
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneously active workers
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct PoolShared {
    intake: Arc<Intake>,
    ledger: Arc<dyn LedgerClient>,
    results: mpsc::Sender<Upload>,
    counters: Arc<PoolCounters>,
    config: IngestConfig,
    session: Uuid,
}

/// Handle to a running pool
pub struct WorkerPool {
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Start `min_workers` workers; the receiver closes when the last one exits
    pub fn start(
        intake: Arc<Intake>,
        ledger: Arc<dyn LedgerClient>,
        config: IngestConfig,
        session: Uuid,
    ) -> (Self, mpsc::Receiver<Upload>) {
        let (results, rx) = mpsc::channel(config.result_buffer.max(1));
        let counters = Arc::new(PoolCounters::default());
        let min_workers = config.min_workers.max(1);

        let shared = Arc::new(PoolShared {
            intake,
            ledger,
            results,
            counters: Arc::clone(&counters),
            config,
            session,
        });

        for _ in 0..min_workers {
            shared.counters.active.fetch_add(1, Ordering::SeqCst);
            spawn_worker(Arc::clone(&shared));
        }
        info!(workers = min_workers, "Worker pool started");

        (Self { counters }, rx)
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        Arc::clone(&self.counters)
    }
}

/// Spawn a worker that has already been counted as active
fn spawn_worker(shared: Arc<PoolShared>) {
    let id = shared.counters.spawned.fetch_add(1, Ordering::SeqCst);
    shared
        .counters
        .peak
        .fetch_max(shared.counters.active(), Ordering::SeqCst);
    tokio::spawn(run_worker(shared, id));
}

async fn run_worker(shared: Arc<PoolShared>, id: usize) {
    debug!(worker = id, "Worker started");

    loop {
        let notified = shared.intake.work_notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match shared.intake.poll_work(shared.config.worker_batch) {
            Work::Batch(chunks) => {
                shared.maybe_grow();
                if !shared.upload(chunks).await {
                    debug!(worker = id, "Result channel closed");
                    break;
                }
            }
            Work::Finished => break,
            Work::Idle => {
                if shared.try_shrink() {
                    debug!(worker = id, "Worker retired (idle)");
                    return;
                }
                notified.await;
            }
        }
    }

    shared.counters.active.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = id, "Worker retired");
}

impl PoolShared {
    /// Add a worker when the queue exceeds `active * growth_factor`
    fn maybe_grow(self: &Arc<Self>) {
        let queued = self.intake.queued() as f64;
        loop {
            let active = self.counters.active();
            if active >= self.config.max_workers
                || queued <= active as f64 * self.config.growth_factor
            {
                return;
            }
            if self
                .counters
                .active
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                info!(active = active + 1, queued = queued as u64, "Growing worker pool");
                spawn_worker(Arc::clone(self));
                return;
            }
        }
    }

    /// Give up this worker's slot if more than `min_workers` remain
    fn try_shrink(&self) -> bool {
        let min = self.config.min_workers.max(1);
        loop {
            let active = self.counters.active();
            if active <= min {
                return false;
            }
            if self
                .counters
                .active
                .compare_exchange(active, active - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Upload a run of chunks concurrently, releasing results in order
    async fn upload(&self, chunks: Vec<Chunk>) -> bool {
        let mut inflight = FuturesOrdered::new();

        for chunk in chunks {
            let ledger = Arc::clone(&self.ledger);
            let tags = vec![
                Tag::new("Content-Type", "application/octet-stream"),
                Tag::new("Channel", chunk.channel.clone()),
                Tag::new("Session", self.session.to_string()),
                Tag::new("Seq", chunk.seq.to_string()),
                Tag::new("Captured-At", chunk.captured_at.to_rfc3339()),
            ];
            inflight.push_back(async move {
                let len = chunk.len();
                // no earlier block is known to precede a duplicate's first copy
                let outcome = put_idempotent(ledger.as_ref(), chunk.data, tags, None).await;
                Upload {
                    seq: chunk.seq,
                    channel: chunk.channel,
                    captured_at: chunk.captured_at,
                    len,
                    outcome,
                }
            });
        }

        while let Some(upload) = inflight.next().await {
            debug!(seq = upload.seq, channel = %upload.channel, ok = upload.outcome.is_ok(), "Chunk uploaded");
            if self.results.send(upload).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::DropPolicy;
    use crate::ledger::MemoryLedger;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    fn config(min: usize, max: usize) -> IngestConfig {
        IngestConfig {
            min_workers: min,
            max_workers: max,
            worker_batch: 2,
            ..IngestConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_arrive_for_every_chunk() {
        let ledger = Arc::new(MemoryLedger::instant().with_latency(1..10, 3));
        let intake = Arc::new(Intake::new(64));
        let sender = intake.sender("capture", DropPolicy::Block);
        for i in 0..40u8 {
            sender.send(Bytes::from(vec![i; 3])).await.unwrap();
        }
        drop(sender);
        intake.seal();

        let (pool, mut rx) = WorkerPool::start(intake, ledger, config(1, 4), Uuid::new_v4());
        let mut seqs = Vec::new();
        while let Some(upload) = rx.recv().await {
            assert!(upload.outcome.is_ok());
            seqs.push(upload.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (0..40).collect::<Vec<_>>());
        assert!(pool.counters().peak() > 1);
        assert_eq!(pool.counters().active(), 0);
    }

    #[tokio::test]
    async fn test_single_worker_releases_in_order() {
        let ledger = Arc::new(MemoryLedger::instant().with_latency(1..20, 11));
        let intake = Arc::new(Intake::new(64));
        let sender = intake.sender("capture", DropPolicy::Block);
        for i in 0..12u8 {
            sender.send(Bytes::from(vec![i])).await.unwrap();
        }
        drop(sender);
        intake.seal();

        let (_pool, mut rx) = WorkerPool::start(intake, ledger, config(1, 1), Uuid::new_v4());
        let mut seqs = Vec::new();
        while let Some(upload) = rx.recv().await {
            seqs.push(upload.seq);
        }
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_upload_is_reported() {
        let ledger = Arc::new(MemoryLedger::instant());
        ledger.fail_next_puts(1);
        let intake = Arc::new(Intake::new(8));
        let sender = intake.sender("capture", DropPolicy::Block);
        sender.send(Bytes::from_static(b"x")).await.unwrap();
        drop(sender);
        intake.seal();

        let (_pool, mut rx) = WorkerPool::start(intake, ledger, config(1, 1), Uuid::new_v4());
        let upload = rx.recv().await.unwrap();
        assert!(upload.outcome.is_err());
        assert_eq!(upload.len, 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_chunk_already_on_ledger_counts_as_uploaded() {
        let ledger = Arc::new(MemoryLedger::instant());
        let session = Uuid::new_v4();
        let captured_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let existing = ledger
            .put(
                Bytes::from_static(b"dup"),
                vec![
                    Tag::new("Content-Type", "application/octet-stream"),
                    Tag::new("Channel", "capture"),
                    Tag::new("Session", session.to_string()),
                    Tag::new("Seq", "0"),
                    Tag::new("Captured-At", captured_at.to_rfc3339()),
                ],
            )
            .await
            .unwrap();

        let intake = Arc::new(Intake::new(8));
        let sender = intake.sender("capture", DropPolicy::Block);
        sender
            .send_at(Bytes::from_static(b"dup"), captured_at)
            .await
            .unwrap();
        drop(sender);
        intake.seal();

        let (_pool, mut rx) = WorkerPool::start(intake, ledger.clone(), config(1, 1), session);
        let upload = rx.recv().await.unwrap();
        let record = upload.outcome.unwrap();
        assert_eq!(record.id, existing.id);
        assert_eq!(record.block.height, 0);
        assert_eq!(ledger.stored_ids().len(), 1);
    }
}
