//! Record resolution by forward block scan with a single-bundle cache
//!
//! A record is looked up in the last bundle that resolved anything, then
//! fetched directly when the ledger serves it by id, and finally found by
//! walking blocks forward from its minimum block reference. Each block's
//! container transactions are checked for a manifest entry naming the
//! record; at the tip the pending set is searched as well.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::env_or;
use crate::error::{LedgerError, LedgerResult};
use crate::traits::{BlockId, BlockRef, BundleManifest, LedgerClient, RecordId};

/// Heights whose container lists are kept between lookups
const CONTAINER_CACHE_LIMIT: usize = 4096;

/// Forward-scan policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Pause between scan passes that reached the tip without a match
    pub cooldown: Duration,

    /// Blocks below the tip that are rescanned on the next pass
    pub safe_depth: u64,

    /// Give up after this many passes (None = keep waiting)
    pub max_passes: Option<u32>,

    /// Try fetching records by id before scanning
    pub direct_first: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            safe_depth: 1,
            max_passes: None,
            direct_first: true,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cooldown: Duration::from_millis(env_or(
                "LEDGERSTREAM_RESOLVER_COOLDOWN_MS",
                defaults.cooldown.as_millis() as u64,
            )),
            safe_depth: env_or("LEDGERSTREAM_RESOLVER_SAFE_DEPTH", defaults.safe_depth),
            max_passes: std::env::var("LEDGERSTREAM_RESOLVER_MAX_PASSES")
                .ok()
                .and_then(|s| s.parse().ok()),
            direct_first: std::env::var("LEDGERSTREAM_RESOLVER_DIRECT_FIRST")
                .ok()
                .map(|s| !(s == "false" || s == "0"))
                .unwrap_or(defaults.direct_first),
        }
    }
}

/// Lookup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub direct_hits: u64,
    pub scan_hits: u64,
    pub blocks_scanned: u64,
    pub passes: u64,
}

struct CachedBundle {
    tx: RecordId,
    manifest: BundleManifest,
}

enum Pass {
    Found(Bytes),
    Exhausted { tip: u64 },
}

/// Resolves record ids to payload bytes
pub struct RecordResolver {
    ledger: Arc<dyn LedgerClient>,
    config: ResolverConfig,
    cache: Option<CachedBundle>,
    containers: HashMap<u64, Vec<RecordId>>,
    retry: HashSet<RecordId>,
    stats: ResolverStats,
}

impl RecordResolver {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: ResolverConfig) -> Self {
        Self {
            ledger,
            config,
            cache: None,
            containers: HashMap::new(),
            retry: HashSet::new(),
            stats: ResolverStats::default(),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Fetch a record's payload, scanning forward from `min_block` if needed
    pub async fn fetch(&mut self, id: &RecordId, min_block: &BlockRef) -> LedgerResult<Bytes> {
        if let Some(data) = self.from_cache(id).await {
            self.stats.cache_hits += 1;
            return Ok(data);
        }

        if self.config.direct_first {
            match self.ledger.get(id).await {
                Ok(data) => {
                    self.stats.direct_hits += 1;
                    return Ok(data);
                }
                Err(e) if e.is_not_found() => {
                    debug!(id = %id, "Direct fetch missed, scanning blocks");
                }
                Err(e) => return Err(e),
            }
        }

        let mut start = min_block.height;
        let mut passes = 0u32;
        loop {
            passes += 1;
            self.stats.passes += 1;

            match self.scan_pass(id, start).await? {
                Pass::Found(data) => {
                    self.stats.scan_hits += 1;
                    return Ok(data);
                }
                Pass::Exhausted { tip } => {
                    if self.config.max_passes.is_some_and(|max| passes >= max) {
                        return Err(LedgerError::NotFound(format!(
                            "{id} not found scanning from height {} after {passes} passes",
                            min_block.height
                        )));
                    }
                    start = start.max(tip.saturating_sub(self.config.safe_depth));
                    warn!(
                        id = %id,
                        tip,
                        next_start = start,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Record not visible yet, cooling down"
                    );
                    tokio::time::sleep(self.config.cooldown).await;
                }
            }
        }
    }

    async fn from_cache(&mut self, id: &RecordId) -> Option<Bytes> {
        let cached = self.cache.as_ref()?;
        let entry = cached.manifest.find(id)?.clone();
        let tx = cached.tx.clone();

        match self
            .ledger
            .get_range(&tx, entry.offset, entry.offset + entry.length)
            .await
        {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(bundle = %tx, error = %e, "Dropping cached bundle");
                self.cache = None;
                None
            }
        }
    }

    async fn scan_pass(&mut self, id: &RecordId, start: u64) -> LedgerResult<Pass> {
        let mut tip = self.ledger.current_height().await?;
        let mut height = if start > tip {
            tip.saturating_sub(self.config.safe_depth)
        } else {
            start
        };

        loop {
            while height <= tip {
                let candidates = self.containers_at(height, tip).await?;
                self.stats.blocks_scanned += 1;
                if let Some(data) = self.search(id, &candidates).await? {
                    return Ok(Pass::Found(data));
                }
                height += 1;
            }

            let pending = self.pending_containers().await?;
            if let Some(data) = self.search(id, &pending).await? {
                return Ok(Pass::Found(data));
            }

            let retry: Vec<RecordId> = self.retry.drain().collect();
            if let Some(data) = self.search(id, &retry).await? {
                return Ok(Pass::Found(data));
            }

            let latest = self.ledger.current_height().await?;
            if latest > tip {
                tip = latest;
                continue;
            }

            // Blocks near the tip may still be replaced
            let floor = tip.saturating_sub(self.config.safe_depth);
            self.containers.retain(|h, _| *h < floor);
            return Ok(Pass::Exhausted { tip });
        }
    }

    async fn containers_at(&mut self, height: u64, tip: u64) -> LedgerResult<Vec<RecordId>> {
        if let Some(cached) = self.containers.get(&height) {
            return Ok(cached.clone());
        }

        let block = self.ledger.block_at(BlockId::Height(height)).await?;
        let containers = self.filter_containers(&block.tx_ids).await?;

        if height + self.config.safe_depth <= tip {
            if self.containers.len() >= CONTAINER_CACHE_LIMIT {
                self.containers.clear();
            }
            self.containers.insert(height, containers.clone());
        }
        Ok(containers)
    }

    async fn pending_containers(&self) -> LedgerResult<Vec<RecordId>> {
        let pending = self.ledger.pending_tx_ids().await?;
        self.filter_containers(&pending).await
    }

    async fn filter_containers(&self, txs: &[RecordId]) -> LedgerResult<Vec<RecordId>> {
        let mut containers = Vec::new();
        for tx in txs {
            match self.ledger.tags_of(tx).await {
                Ok(tags) if self.ledger.is_container(&tags) => containers.push(tx.clone()),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    /// Look for `id` in the manifests of `candidates`
    async fn search(&mut self, id: &RecordId, candidates: &[RecordId]) -> LedgerResult<Option<Bytes>> {
        for tx in candidates {
            let manifest = match self.ledger.bundle_manifest(tx).await {
                Ok(manifest) => manifest,
                Err(e) if e.is_not_found() || e.is_transient() => {
                    debug!(bundle = %tx, error = %e, "Bundle not readable yet");
                    self.retry.insert(tx.clone());
                    continue;
                }
                Err(LedgerError::InvalidResponse(reason)) => {
                    debug!(bundle = %tx, reason = %reason, "Skipping unreadable bundle");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(entry) = manifest.find(id).cloned() else {
                continue;
            };

            match self
                .ledger
                .get_range(tx, entry.offset, entry.offset + entry.length)
                .await
            {
                Ok(data) => {
                    debug!(id = %id, bundle = %tx, "Resolved record from bundle");
                    self.cache = Some(CachedBundle {
                        tx: tx.clone(),
                        manifest,
                    });
                    return Ok(Some(data));
                }
                Err(e) if e.is_not_found() => {
                    self.retry.insert(tx.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
