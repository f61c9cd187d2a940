//! Batch commit with rollback and retry

use std::time::Duration;

use tracing::{debug, error, warn};

use super::config::IngestConfig;
use crate::error::{IndexError, IngestError};
use crate::index::{ChainIndex, LeafPayload};
use crate::locator::Locator;
use crate::traits::BlockRef;

/// Append one leaf and persist the resulting snapshot
///
/// Any failure restores the index to its state before the attempt, so a
/// retry starts from the same frontier. Structural errors are returned
/// immediately; ledger errors are retried with exponential backoff.
pub async fn commit_batch(
    index: &mut ChainIndex,
    size: u64,
    payload: LeafPayload,
    snapshot_block: &BlockRef,
    config: &IngestConfig,
) -> Result<Locator, IngestError> {
    let mut attempt = 0;
    let mut delay_ms = config.commit_retry_base_ms;

    loop {
        attempt += 1;
        let checkpoint = index.checkpoint();

        match try_commit(index, size, payload.clone(), snapshot_block).await {
            Ok(locator) => return Ok(locator),
            Err(e) => {
                index.restore(checkpoint);

                if e.is_structural() {
                    error!(attempt, error = %e, "Batch commit hit a structural error");
                    return Err(IngestError::Commit {
                        attempts: attempt,
                        source: e,
                    });
                }
                if attempt >= config.commit_retry_count {
                    error!(attempt, error = %e, "Batch commit failed after retries");
                    return Err(IngestError::Commit {
                        attempts: attempt,
                        source: e,
                    });
                }

                warn!(
                    attempt,
                    max_attempts = config.commit_retry_count,
                    delay_ms,
                    error = %e,
                    "Batch commit failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = delay_ms.saturating_mul(2);
            }
        }
    }
}

async fn try_commit(
    index: &mut ChainIndex,
    size: u64,
    payload: LeafPayload,
    snapshot_block: &BlockRef,
) -> Result<Locator, IndexError> {
    let merged = index.append(size, payload).await?;
    if let Some(node) = merged {
        debug!(weight = node.weight, reference = %node.reference, "Merged frontier segment");
    }
    index.persist_snapshot(snapshot_block.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::traits::RecordId;
    use chrono::Utc;
    use std::sync::Arc;

    fn payload(block: &BlockRef, len: u64) -> LeafPayload {
        let mut payload = LeafPayload::new(block.clone());
        payload
            .channels
            .entry("capture".into())
            .or_default()
            .push(RecordId::new(format!("chunk-{len}")), Utc::now(), len);
        payload
    }

    fn fast_config(retries: u32) -> IngestConfig {
        IngestConfig {
            commit_retry_count: retries,
            commit_retry_base_ms: 1,
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commit_produces_locator() {
        let ledger = Arc::new(MemoryLedger::instant());
        let mut index = ChainIndex::new(ledger.clone(), 2).unwrap();
        let block = BlockRef::new(0, "genesis");

        let locator = commit_batch(&mut index, 4, payload(&block, 4), &block, &fast_config(3))
            .await
            .unwrap();
        assert_eq!(locator.leaves, 1);
        assert_eq!(locator.size, 4);
        assert_eq!(locator.min_block.height, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let ledger = Arc::new(MemoryLedger::instant());
        let mut index = ChainIndex::new(ledger.clone(), 2).unwrap();
        let block = BlockRef::new(0, "genesis");

        commit_batch(&mut index, 1, payload(&block, 1), &block, &fast_config(3))
            .await
            .unwrap();

        // No merge at two leaves; the snapshot put fails once
        ledger.fail_next_puts(1);
        let locator = commit_batch(&mut index, 2, payload(&block, 2), &block, &fast_config(3))
            .await
            .unwrap();
        assert_eq!(locator.leaves, 2);
        assert_eq!(index.frontier().weight(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_restore_the_index() {
        let ledger = Arc::new(MemoryLedger::instant());
        let mut index = ChainIndex::new(ledger.clone(), 2).unwrap();
        let block = BlockRef::new(0, "genesis");

        commit_batch(&mut index, 1, payload(&block, 1), &block, &fast_config(2))
            .await
            .unwrap();
        let before = serde_json::to_string(index.frontier()).unwrap();
        let locator_before = index.locator().cloned();

        ledger.fail_next_puts(10);
        let err = commit_batch(&mut index, 2, payload(&block, 2), &block, &fast_config(2))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Commit { attempts: 2, .. }));
        assert_eq!(serde_json::to_string(index.frontier()).unwrap(), before);
        assert_eq!(index.locator().cloned(), locator_before);
    }
}
