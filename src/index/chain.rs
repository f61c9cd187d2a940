//! Chain index: frontier maintenance and persistence

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::frontier::Frontier;
use super::node::{IndexNode, IndexRecord, InternalNode, LeafNode, LeafPayload};
use crate::decode::RecordResolver;
use crate::error::{IndexError, IndexResult};
use crate::ledger::put_idempotent;
use crate::locator::{digest_hex, Locator};
use crate::traits::{BlockRef, LedgerClient, LedgerRecord, Tag};

/// Saved index state for rolling back a failed commit
#[derive(Debug, Clone)]
pub struct IndexCheckpoint {
    frontier: Frontier,
    segments: u64,
    snapshots: u64,
    locator: Option<Locator>,
}

/// Append-only index over every leaf captured in a session
///
/// Only one caller may append at a time; the ingest pipeline funnels all
/// batches through a single consumer.
pub struct ChainIndex {
    degree: u64,
    frontier: Frontier,
    ledger: Arc<dyn LedgerClient>,
    session: Uuid,
    segments: u64,
    snapshots: u64,
    locator: Option<Locator>,
}

impl ChainIndex {
    pub fn new(ledger: Arc<dyn LedgerClient>, degree: u64) -> IndexResult<Self> {
        if degree < 2 {
            return Err(IndexError::InvalidDegree(degree));
        }
        Ok(Self {
            degree,
            frontier: Frontier::new(),
            ledger,
            session: Uuid::new_v4(),
            segments: 0,
            snapshots: 0,
            locator: None,
        })
    }

    /// Rebuild the index from a locator so capture can continue it
    pub async fn resume(
        ledger: Arc<dyn LedgerClient>,
        degree: u64,
        locator: &Locator,
        resolver: &mut RecordResolver,
    ) -> IndexResult<Self> {
        let mut index = Self::new(ledger, degree)?;
        let head = locator
            .head()
            .ok_or_else(|| IndexError::Invariant("locator names no index record".into()))?;

        let data = resolver.fetch(head, &locator.min_block).await?;
        if !locator.verify(&data) {
            return Err(IndexError::MalformedRecord {
                id: head.clone(),
                reason: "payload does not match locator digest".into(),
            });
        }

        let record = IndexRecord::from_bytes(head, &data)?;
        index.frontier = Frontier::from_nodes(record.nodes)?;
        if index.frontier.weight() != locator.leaves || index.frontier.size() != locator.size {
            return Err(IndexError::Invariant(format!(
                "snapshot {head} holds {} leaves / {} bytes, locator declares {} / {}",
                index.frontier.weight(),
                index.frontier.size(),
                locator.leaves,
                locator.size
            )));
        }
        index.locator = Some(locator.clone());

        info!(
            head = %head,
            leaves = index.frontier.weight(),
            entries = index.frontier.len(),
            "Resumed chain index"
        );
        Ok(index)
    }

    pub fn degree(&self) -> u64 {
        self.degree
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    /// Copy of the frontier for embedding in the next index record
    pub fn snapshot(&self) -> Frontier {
        self.frontier.clone()
    }

    /// Latest persisted locator
    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    /// Add one leaf, persisting the folded suffix when the merge rule fires
    ///
    /// On error the frontier is left exactly as it was. Returns the new
    /// internal node when a merge happened.
    pub async fn append(
        &mut self,
        size: u64,
        payload: LeafPayload,
    ) -> IndexResult<Option<InternalNode>> {
        let leaf = IndexNode::Leaf(LeafNode::new(size, payload));

        let merged = match self.frontier.merge_point(self.degree) {
            Some(point) => {
                let suffix = &self.frontier.nodes()[point.start..];
                let floor = suffix
                    .iter()
                    .map(|n| n.min_block().clone())
                    .reduce(BlockRef::earliest);
                let record = IndexRecord::new(suffix.to_vec());

                let persisted = self
                    .put_record(&record, "segment", self.segments, floor.clone())
                    .await?;

                let internal = InternalNode {
                    weight: point.weight,
                    size: point.size,
                    reference: persisted.id,
                    min_block: match floor {
                        Some(floor) => floor.earliest(persisted.block),
                        None => persisted.block,
                    },
                };
                debug!(
                    start = point.start,
                    weight = internal.weight,
                    size = internal.size,
                    reference = %internal.reference,
                    "Folded frontier suffix"
                );

                self.segments += 1;
                self.frontier
                    .fold(point.start, IndexNode::Internal(internal.clone()));
                Some(internal)
            }
            None => None,
        };

        self.frontier.push(leaf);
        Ok(merged)
    }

    /// Persist the whole frontier and produce the new locator
    pub async fn persist_snapshot(&mut self, min_block: BlockRef) -> IndexResult<Locator> {
        if self.frontier.is_empty() {
            return Err(IndexError::Invariant("snapshot of an empty index".into()));
        }

        let record = IndexRecord::new(self.frontier.nodes().to_vec());
        let bytes = record.to_bytes()?;
        let digest = digest_hex(&bytes);
        let persisted = self
            .put_bytes(bytes, "snapshot", self.snapshots, self.frontier.min_block())
            .await?;
        self.snapshots += 1;

        let locator = Locator {
            index: vec![persisted.id],
            min_block: min_block.earliest(persisted.block),
            timestamp: persisted.timestamp.unwrap_or_else(Utc::now),
            sha256: Some(digest),
            leaves: self.frontier.weight(),
            size: self.frontier.size(),
        };
        self.locator = Some(locator.clone());
        Ok(locator)
    }

    pub fn checkpoint(&self) -> IndexCheckpoint {
        IndexCheckpoint {
            frontier: self.frontier.clone(),
            segments: self.segments,
            snapshots: self.snapshots,
            locator: self.locator.clone(),
        }
    }

    /// Return to a checkpoint taken earlier in this session
    pub fn restore(&mut self, checkpoint: IndexCheckpoint) {
        self.frontier = checkpoint.frontier;
        self.segments = checkpoint.segments;
        self.snapshots = checkpoint.snapshots;
        self.locator = checkpoint.locator;
    }

    async fn put_record(
        &self,
        record: &IndexRecord,
        kind: &str,
        seq: u64,
        floor: Option<BlockRef>,
    ) -> IndexResult<LedgerRecord> {
        self.put_bytes(record.to_bytes()?, kind, seq, floor).await
    }

    async fn put_bytes(
        &self,
        bytes: bytes::Bytes,
        kind: &str,
        seq: u64,
        floor: Option<BlockRef>,
    ) -> IndexResult<LedgerRecord> {
        let tags = vec![
            Tag::new("Content-Type", "application/json"),
            Tag::new("Index-Kind", kind),
            Tag::new("Session", self.session.to_string()),
            Tag::new("Seq", seq.to_string()),
        ];
        // every referenced entry was stored before this record, so its
        // earliest block is a safe position for a duplicate
        Ok(put_idempotent(self.ledger.as_ref(), bytes, tags, floor).await?)
    }
}
