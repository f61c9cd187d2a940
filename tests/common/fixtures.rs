//! Test fixtures and pipeline setup utilities

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ledgerstream::decode::{Decoder, RecordResolver, ResolverConfig};
use ledgerstream::error::IngestError;
use ledgerstream::index::{ChainIndex, LeafPayload};
use ledgerstream::ingest::{IngestConfig, IngestHandle, IngestPipeline, IngestSummary};
use ledgerstream::locator::Locator;
use ledgerstream::traits::{LedgerClient, Tag};
use ledgerstream::MemoryLedger;

/// Running pipeline plus the sender of its shutdown signal
pub struct TestPipeline {
    pub handle: IngestHandle,
    pub task: JoinHandle<Result<IngestSummary, IngestError>>,
    pub shutdown: broadcast::Sender<()>,
}

impl TestPipeline {
    /// Drop the handle and wait for the backlog to drain
    pub async fn finish(self) -> IngestSummary {
        drop(self.handle);
        self.task
            .await
            .expect("ingest task panicked")
            .expect("ingest pipeline failed")
    }
}

/// Small batches and fast commit retries
pub fn test_config(degree: u64) -> IngestConfig {
    IngestConfig {
        degree,
        max_workers: 8,
        worker_batch: 3,
        max_batch_items: 4,
        commit_retry_base_ms: 1,
        ..IngestConfig::default()
    }
}

/// Resolver that fails fast instead of waiting for content
pub fn quick_resolver(ledger: Arc<dyn LedgerClient>) -> RecordResolver {
    RecordResolver::new(
        ledger,
        ResolverConfig {
            cooldown: Duration::from_millis(5),
            max_passes: Some(3),
            ..ResolverConfig::default()
        },
    )
}

/// Start a pipeline over `ledger` with a fresh index
pub fn start_pipeline(ledger: Arc<dyn LedgerClient>, config: IngestConfig) -> TestPipeline {
    let index = ChainIndex::new(Arc::clone(&ledger), config.degree).expect("valid degree");
    let (shutdown, rx) = broadcast::channel(1);
    let (handle, task) = IngestPipeline::new(ledger, index, config).start(rx);
    TestPipeline {
        handle,
        task,
        shutdown,
    }
}

/// Deterministic chunks of varying length; chunk `i` starts with its index
pub fn make_chunks(count: usize, seed: u64) -> Vec<Bytes> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let len = rng.gen_range(1..64);
            let mut data = (i as u32).to_be_bytes().to_vec();
            data.extend((0..len).map(|_| rng.gen::<u8>()));
            Bytes::from(data)
        })
        .collect()
}

/// Decode every channel below a locator
pub async fn decode_channels(
    ledger: Arc<dyn LedgerClient>,
    locator: &Locator,
    primary: &str,
) -> BTreeMap<String, Vec<u8>> {
    Decoder::from_locator(quick_resolver(ledger), locator, primary)
        .await
        .expect("locator resolves")
        .collect_channels()
        .await
        .expect("decode succeeds")
}

/// Leaf over freshly stored chunks on a single channel
pub async fn stored_leaf<C: AsRef<[u8]>>(
    ledger: &MemoryLedger,
    channel: &str,
    chunks: &[C],
) -> (u64, LeafPayload) {
    let tip = ledger.current_block().await.expect("tip readable");
    let mut payload = LeafPayload::new(tip);
    for data in chunks {
        let data = data.as_ref();
        let record = ledger
            .put(
                Bytes::copy_from_slice(data),
                vec![Tag::new("Channel", channel), Tag::new("Nonce", uuid::Uuid::new_v4().to_string())],
            )
            .await
            .expect("put succeeds");
        payload
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(record.id, Utc::now(), data.len() as u64);
    }
    (payload.channel_len(channel), payload)
}
