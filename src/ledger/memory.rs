//! In-process ledger with fault injection
//!
//! Used by tests and dry runs. Faults are armed through atomic counters so a
//! test can share the ledger behind an `Arc` while the pipeline runs.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::state::{ChainShape, ChainState};
use crate::error::{LedgerError, LedgerResult};
use crate::traits::{
    Block, BlockId, BlockRef, BundleManifest, LedgerClient, LedgerRecord, RecordId, Tag,
};

/// Ledger kept entirely in memory
pub struct MemoryLedger {
    state: Mutex<ChainState>,

    /// Number of upcoming puts that fail with a network error
    pub fail_puts: AtomicUsize,

    /// Number of upcoming puts that are stored but answer with a timeout
    pub lose_acks: AtomicUsize,

    /// Number of upcoming read calls that fail with a network error
    pub fail_reads: AtomicUsize,

    /// Count of put calls, including failed ones
    pub put_call_count: AtomicUsize,

    /// Count of `get`/`get_range` calls
    pub get_call_count: AtomicUsize,

    latency: Mutex<Option<(Range<u64>, StdRng)>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(ChainShape::default())
    }
}

impl MemoryLedger {
    pub fn new(shape: ChainShape) -> Self {
        Self {
            state: Mutex::new(ChainState::new(shape)),
            fail_puts: AtomicUsize::new(0),
            lose_acks: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            put_call_count: AtomicUsize::new(0),
            get_call_count: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    /// Ledger that posts and mines every payload immediately
    pub fn instant() -> Self {
        Self::new(ChainShape {
            items_per_bundle: 1,
            bundles_per_block: 1,
        })
    }

    /// Delay every put by a random duration drawn from `range` (milliseconds)
    pub fn with_latency(self, range: Range<u64>, seed: u64) -> Self {
        if let Ok(mut latency) = self.latency.lock() {
            *latency = Some((range, StdRng::seed_from_u64(seed)));
        }
        self
    }

    /// Fail the next `n` puts with a network error
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Store the next `n` puts but report a timeout to the caller
    pub fn lose_next_acks(&self, n: usize) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` read calls with a network error
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_call_count.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_call_count.load(Ordering::SeqCst)
    }

    /// Post the open bundle and mine everything pending
    pub fn flush(&self) {
        self.with_state(|s| s.flush());
    }

    /// Post the open bundle without mining it
    pub fn post_bundle(&self) -> Option<RecordId> {
        self.with_state(|s| s.post_bundle())
    }

    /// Mine pending transactions into a new block
    pub fn mine(&self) -> BlockRef {
        self.with_state(|s| s.mine())
    }

    /// Ids of stored payloads, in the order they were first accepted
    pub fn stored_ids(&self) -> Vec<RecordId> {
        self.with_state(|s| s.insert_order().to_vec())
    }

    /// Tags a payload was stored with
    pub fn stored_tags(&self, id: &RecordId) -> Option<Vec<Tag>> {
        self.with_state(|s| s.item_tags(id).map(|t| t.to_vec()))
    }

    /// Whether a payload has been stored, visible or not
    pub fn contains(&self, id: &RecordId) -> bool {
        self.with_state(|s| s.contains(id))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read_fault(&self) -> LedgerResult<()> {
        if Self::take_fault(&self.fail_reads) {
            return Err(LedgerError::Network("injected read failure".into()));
        }
        Ok(())
    }

    fn next_delay(&self) -> Option<Duration> {
        let mut latency = self.latency.lock().ok()?;
        let (range, rng) = latency.as_mut()?;
        if range.is_empty() {
            return None;
        }
        Some(Duration::from_millis(rng.gen_range(range.clone())))
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn put(&self, data: Bytes, tags: Vec<Tag>) -> LedgerResult<LedgerRecord> {
        self.put_call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.next_delay() {
            tokio::time::sleep(delay).await;
        }

        if Self::take_fault(&self.fail_puts) {
            return Err(LedgerError::Network("injected put failure".into()));
        }

        let record = self.with_state(|s| s.insert(data, tags, Utc::now()))?;

        if Self::take_fault(&self.lose_acks) {
            return Err(LedgerError::Timeout(0));
        }
        Ok(record)
    }

    async fn get(&self, id: &RecordId) -> LedgerResult<Bytes> {
        self.get_call_count.fetch_add(1, Ordering::SeqCst);
        self.read_fault()?;
        self.with_state(|s| s.get(id))
    }

    async fn get_range(&self, id: &RecordId, start: u64, end: u64) -> LedgerResult<Bytes> {
        self.get_call_count.fetch_add(1, Ordering::SeqCst);
        self.read_fault()?;
        self.with_state(|s| s.get_range(id, start, end))
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        self.read_fault()?;
        Ok(self.with_state(|s| s.tip().height))
    }

    async fn block_at(&self, block: BlockId) -> LedgerResult<Block> {
        self.read_fault()?;
        self.with_state(|s| s.block_at(&block))
    }

    async fn tags_of(&self, tx: &RecordId) -> LedgerResult<Vec<Tag>> {
        self.read_fault()?;
        self.with_state(|s| s.tags_of(tx))
    }

    async fn pending_tx_ids(&self) -> LedgerResult<Vec<RecordId>> {
        self.read_fault()?;
        Ok(self.with_state(|s| s.pending()))
    }

    async fn bundle_manifest(&self, tx: &RecordId) -> LedgerResult<BundleManifest> {
        self.read_fault()?;
        self.with_state(|s| s.bundle_manifest(tx))
    }
}
