//! Retry adapter for ledger clients
//!
//! Transient failures are retried with exponential backoff and jitter.
//! A duplicate submission is answered with the original id.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::env_or;
use crate::error::{LedgerError, LedgerResult};
use crate::traits::{
    Block, BlockId, BlockRef, BundleManifest, LedgerClient, LedgerRecord, RecordId, Tag,
};

/// Backoff policy for transient ledger errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt (None = retry indefinitely)
    pub max_retries: Option<u32>,

    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound on the delay between retries (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Load configuration from environment variables
    ///
    /// `LEDGERSTREAM_RETRY_MAX` of `0` or more caps the retries; unset keeps
    /// retrying forever.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: std::env::var("LEDGERSTREAM_RETRY_MAX")
                .ok()
                .and_then(|s| s.parse().ok()),
            base_delay_ms: env_or("LEDGERSTREAM_RETRY_BASE_MS", defaults.base_delay_ms),
            max_delay_ms: env_or("LEDGERSTREAM_RETRY_MAX_DELAY_MS", defaults.max_delay_ms),
        }
    }

    /// Policy with a fixed retry budget and short delays
    pub fn bounded(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries: Some(max_retries),
            base_delay_ms,
            max_delay_ms: base_delay_ms.saturating_mul(16).max(1),
        }
    }

    fn exhausted(&self, retries: u32) -> bool {
        self.max_retries.is_some_and(|max| retries >= max)
    }
}

/// Backoff delay with jitter of up to one extra base step
pub(crate) fn jittered(delay_ms: u64) -> Duration {
    let jitter = rand::random::<u64>() % delay_ms.max(1);
    Duration::from_millis(delay_ms + jitter)
}

/// Submit a payload, accepting an "already recorded" answer as success
///
/// The duplicate is reported at `floor`, a block observed before the
/// submission began, or at genesis when no such block is known.
pub async fn put_idempotent(
    ledger: &dyn LedgerClient,
    data: Bytes,
    tags: Vec<Tag>,
    floor: Option<BlockRef>,
) -> LedgerResult<LedgerRecord> {
    match ledger.put(data, tags).await {
        Err(LedgerError::AlreadyRecorded(id)) => {
            debug!(id = %id, "Payload already recorded, reusing id");
            let block = match floor {
                Some(block) => block,
                None => ledger.block_at(BlockId::Height(0)).await?.block_ref(),
            };
            Ok(LedgerRecord {
                id,
                block,
                timestamp: None,
            })
        }
        other => other,
    }
}

/// Ledger client wrapper that absorbs transient failures
pub struct RetryingLedger {
    inner: Arc<dyn LedgerClient>,
    config: RetryConfig,
    last_seen: Mutex<Option<BlockRef>>,
}

impl RetryingLedger {
    pub fn new(inner: Arc<dyn LedgerClient>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            last_seen: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, f: F) -> LedgerResult<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = LedgerResult<T>> + Send,
        T: Send,
    {
        let mut delay_ms = self.config.base_delay_ms;
        let mut retries = 0u32;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.config.exhausted(retries) => {
                    retries += 1;
                    warn!(op, attempt = retries, delay_ms, error = %e, "Transient ledger error, retrying");
                    tokio::time::sleep(jittered(delay_ms)).await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(self.config.max_delay_ms.max(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observed(&self) -> Option<BlockRef> {
        self.last_seen.lock().ok().and_then(|g| g.clone())
    }

    fn observe(&self, block: &BlockRef) {
        if let Ok(mut seen) = self.last_seen.lock() {
            let newer = seen.as_ref().map_or(true, |s| s.height < block.height);
            if newer {
                *seen = Some(block.clone());
            }
        }
    }

    /// Block reference for a payload the ledger already held
    ///
    /// Uses a block observed before this submission began, so the reference
    /// can only be earlier than where the payload was actually recorded.
    async fn duplicate_floor(&self, floor: Option<BlockRef>) -> LedgerResult<BlockRef> {
        match floor {
            Some(block) => Ok(block),
            None => Ok(self
                .with_retry("block_at", || self.inner.block_at(BlockId::Height(0)))
                .await?
                .block_ref()),
        }
    }
}

#[async_trait]
impl LedgerClient for RetryingLedger {
    async fn put(&self, data: Bytes, tags: Vec<Tag>) -> LedgerResult<LedgerRecord> {
        let floor = self.observed();
        let result = self
            .with_retry("put", || self.inner.put(data.clone(), tags.clone()))
            .await;

        match result {
            Ok(record) => {
                self.observe(&record.block);
                Ok(record)
            }
            Err(LedgerError::AlreadyRecorded(id)) => {
                debug!(id = %id, "Payload already recorded, reusing id");
                let block = self.duplicate_floor(floor).await?;
                Ok(LedgerRecord {
                    id,
                    block,
                    timestamp: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, id: &RecordId) -> LedgerResult<Bytes> {
        self.with_retry("get", || self.inner.get(id)).await
    }

    async fn get_range(&self, id: &RecordId, start: u64, end: u64) -> LedgerResult<Bytes> {
        self.with_retry("get_range", || self.inner.get_range(id, start, end))
            .await
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        self.with_retry("current_height", || self.inner.current_height())
            .await
    }

    async fn block_at(&self, block: BlockId) -> LedgerResult<Block> {
        self.with_retry("block_at", || self.inner.block_at(block.clone()))
            .await
    }

    async fn tags_of(&self, tx: &RecordId) -> LedgerResult<Vec<Tag>> {
        self.with_retry("tags_of", || self.inner.tags_of(tx)).await
    }

    async fn pending_tx_ids(&self) -> LedgerResult<Vec<RecordId>> {
        self.with_retry("pending_tx_ids", || self.inner.pending_tx_ids())
            .await
    }

    async fn bundle_manifest(&self, tx: &RecordId) -> LedgerResult<BundleManifest> {
        self.with_retry("bundle_manifest", || self.inner.bundle_manifest(tx))
            .await
    }

    fn is_container(&self, tags: &[Tag]) -> bool {
        self.inner.is_container(tags)
    }
}
