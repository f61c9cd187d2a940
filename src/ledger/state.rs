//! Bundle and block bookkeeping shared by the in-process ledgers
//!
//! Payloads accumulate in an open bundle. A full bundle is posted to the
//! pending set, and pending transactions are mined into the next block
//! together with one non-bundle filler transaction.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, LedgerResult};
use crate::traits::{
    Block, BlockId, BlockRef, BundleEntry, BundleManifest, LedgerRecord, RecordId, Tag,
};

/// How payloads are grouped into bundles and blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainShape {
    /// Payloads per bundle before it is posted
    pub items_per_bundle: usize,

    /// Posted bundles per block before it is mined
    pub bundles_per_block: usize,
}

impl Default for ChainShape {
    fn default() -> Self {
        Self {
            items_per_bundle: 4,
            bundles_per_block: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    data: Bytes,
    tags: Vec<Tag>,
    posted: bool,
}

#[derive(Debug, Clone)]
struct StoredBundle {
    manifest: BundleManifest,
    data: Bytes,
}

/// Derive the content address of a submission
pub fn record_id(data: &[u8], tags: &[Tag]) -> RecordId {
    let mut hasher = Sha256::new();
    for tag in tags {
        hasher.update(tag.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(tag.value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(data);
    RecordId::new(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

fn block_hash(prev: &str, height: u64, txs: &[RecordId]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(height.to_be_bytes());
    for tx in txs {
        hasher.update(tx.as_str().as_bytes());
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Deterministic ledger state
#[derive(Debug)]
pub(crate) struct ChainState {
    shape: ChainShape,
    items: HashMap<RecordId, StoredItem>,
    open_bundle: Vec<RecordId>,
    bundles: HashMap<RecordId, StoredBundle>,
    tx_tags: HashMap<RecordId, Vec<Tag>>,
    pending: Vec<RecordId>,
    blocks: Vec<Block>,
    heights: HashMap<String, u64>,
    insert_order: Vec<RecordId>,
}

impl ChainState {
    pub(crate) fn new(shape: ChainShape) -> Self {
        let genesis = Block {
            height: 0,
            hash: block_hash("", 0, &[]),
            tx_ids: vec![],
        };
        let mut heights = HashMap::new();
        heights.insert(genesis.hash.clone(), 0);

        Self {
            shape,
            items: HashMap::new(),
            open_bundle: Vec::new(),
            bundles: HashMap::new(),
            tx_tags: HashMap::new(),
            pending: Vec::new(),
            blocks: vec![genesis],
            heights,
            insert_order: Vec::new(),
        }
    }

    pub(crate) fn tip(&self) -> &Block {
        // genesis is created in new() and blocks are never removed
        &self.blocks[self.blocks.len() - 1]
    }

    pub(crate) fn contains(&self, id: &RecordId) -> bool {
        self.items.contains_key(id)
    }

    /// Store a payload, posting and mining as the shape dictates
    pub(crate) fn insert(
        &mut self,
        data: Bytes,
        tags: Vec<Tag>,
        received_at: DateTime<Utc>,
    ) -> LedgerResult<LedgerRecord> {
        let id = record_id(&data, &tags);
        if self.items.contains_key(&id) {
            return Err(LedgerError::AlreadyRecorded(id));
        }

        let observed = self.tip().block_ref();
        self.tx_tags.insert(id.clone(), tags.clone());
        self.items.insert(
            id.clone(),
            StoredItem {
                data,
                tags,
                posted: false,
            },
        );
        self.open_bundle.push(id.clone());
        self.insert_order.push(id.clone());

        if self.open_bundle.len() >= self.shape.items_per_bundle.max(1) {
            self.post_bundle();
            if self.pending.len() >= self.shape.bundles_per_block.max(1) {
                self.mine();
            }
        }

        Ok(LedgerRecord {
            id,
            block: observed,
            timestamp: Some(received_at),
        })
    }

    /// Post the open bundle to the pending set
    pub(crate) fn post_bundle(&mut self) -> Option<RecordId> {
        if self.open_bundle.is_empty() {
            return None;
        }

        let ids = std::mem::take(&mut self.open_bundle);
        let mut data = BytesMut::new();
        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(item) = self.items.get_mut(id) {
                entries.push(BundleEntry {
                    id: id.clone(),
                    offset: data.len() as u64,
                    length: item.data.len() as u64,
                });
                data.extend_from_slice(&item.data);
                item.posted = true;
            }
        }

        let tags = vec![
            Tag::new("Bundle-Format", "binary"),
            Tag::new("Bundle-Version", "2.0.0"),
        ];
        let manifest_ids: Vec<u8> = ids
            .iter()
            .flat_map(|id| id.as_str().as_bytes().iter().copied())
            .collect();
        let bundle_id = record_id(&manifest_ids, &tags);

        self.tx_tags.insert(bundle_id.clone(), tags);
        self.bundles.insert(
            bundle_id.clone(),
            StoredBundle {
                manifest: BundleManifest { entries },
                data: data.freeze(),
            },
        );
        self.pending.push(bundle_id.clone());
        Some(bundle_id)
    }

    /// Mine pending transactions plus one filler into a new block
    pub(crate) fn mine(&mut self) -> BlockRef {
        let height = self.blocks.len() as u64;
        let prev = self.tip().hash.clone();

        let filler_tags = vec![Tag::new("App-Name", "filler")];
        let filler = record_id(&height.to_be_bytes(), &filler_tags);
        self.tx_tags.insert(filler.clone(), filler_tags);

        let mut tx_ids = std::mem::take(&mut self.pending);
        tx_ids.insert(0, filler);

        let hash = block_hash(&prev, height, &tx_ids);
        self.heights.insert(hash.clone(), height);
        self.blocks.push(Block {
            height,
            hash: hash.clone(),
            tx_ids,
        });
        BlockRef::new(height, hash)
    }

    /// Post and mine everything outstanding
    pub(crate) fn flush(&mut self) {
        self.post_bundle();
        if !self.pending.is_empty() {
            self.mine();
        }
    }

    pub(crate) fn get(&self, id: &RecordId) -> LedgerResult<Bytes> {
        if let Some(item) = self.items.get(id) {
            if item.posted {
                return Ok(item.data.clone());
            }
            return Err(LedgerError::NotFound(format!("{id} not yet propagated")));
        }
        if let Some(bundle) = self.bundles.get(id) {
            return Ok(bundle.data.clone());
        }
        Err(LedgerError::NotFound(id.to_string()))
    }

    pub(crate) fn get_range(&self, id: &RecordId, start: u64, end: u64) -> LedgerResult<Bytes> {
        let data = self.get(id)?;
        if start > end || end > data.len() as u64 {
            return Err(LedgerError::InvalidResponse(format!(
                "range [{start}, {end}) outside {id} of {} bytes",
                data.len()
            )));
        }
        Ok(data.slice(start as usize..end as usize))
    }

    pub(crate) fn block_at(&self, block: &BlockId) -> LedgerResult<Block> {
        let height = match block {
            BlockId::Height(h) => *h,
            BlockId::Hash(hash) => *self
                .heights
                .get(hash)
                .ok_or_else(|| LedgerError::NotFound(format!("block {hash}")))?,
        };
        self.blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("block at height {height}")))
    }

    pub(crate) fn tags_of(&self, tx: &RecordId) -> LedgerResult<Vec<Tag>> {
        self.tx_tags
            .get(tx)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("tx {tx}")))
    }

    pub(crate) fn pending(&self) -> Vec<RecordId> {
        self.pending.clone()
    }

    pub(crate) fn bundle_manifest(&self, tx: &RecordId) -> LedgerResult<BundleManifest> {
        match self.bundles.get(tx) {
            Some(bundle) => Ok(bundle.manifest.clone()),
            None if self.tx_tags.contains_key(tx) => Err(LedgerError::InvalidResponse(format!(
                "{tx} is not a bundle"
            ))),
            None => Err(LedgerError::NotFound(format!("bundle {tx}"))),
        }
    }

    pub(crate) fn item_tags(&self, id: &RecordId) -> Option<&[Tag]> {
        self.items.get(id).map(|i| i.tags.as_slice())
    }

    pub(crate) fn insert_order(&self) -> &[RecordId] {
        &self.insert_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(items: usize, bundles: usize) -> ChainShape {
        ChainShape {
            items_per_bundle: items,
            bundles_per_block: bundles,
        }
    }

    #[test]
    fn test_record_id_depends_on_tags_and_data() {
        let a = record_id(b"x", &[Tag::new("k", "1")]);
        let b = record_id(b"x", &[Tag::new("k", "2")]);
        let c = record_id(b"y", &[Tag::new("k", "1")]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, record_id(b"x", &[Tag::new("k", "1")]));
    }

    #[test]
    fn test_duplicate_insert_reports_original_id() {
        let mut state = ChainState::new(shape(10, 10));
        let first = state
            .insert(Bytes::from_static(b"abc"), vec![], Utc::now())
            .unwrap();

        match state.insert(Bytes::from_static(b"abc"), vec![], Utc::now()) {
            Err(LedgerError::AlreadyRecorded(id)) => assert_eq!(id, first.id),
            other => panic!("expected AlreadyRecorded, got {other:?}"),
        }
    }

    #[test]
    fn test_items_invisible_until_bundle_posted() {
        let mut state = ChainState::new(shape(2, 10));
        let rec = state
            .insert(Bytes::from_static(b"one"), vec![], Utc::now())
            .unwrap();
        assert!(state.get(&rec.id).unwrap_err().is_not_found());

        state
            .insert(Bytes::from_static(b"two"), vec![], Utc::now())
            .unwrap();
        assert_eq!(state.get(&rec.id).unwrap(), Bytes::from_static(b"one"));
        assert_eq!(state.pending().len(), 1);
    }

    #[test]
    fn test_mining_moves_pending_into_block_with_filler() {
        let mut state = ChainState::new(shape(1, 2));
        state.insert(Bytes::from_static(b"a"), vec![], Utc::now()).unwrap();
        assert_eq!(state.tip().height, 0);
        state.insert(Bytes::from_static(b"b"), vec![], Utc::now()).unwrap();

        let tip = state.tip().clone();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.tx_ids.len(), 3);
        assert!(state.pending().is_empty());

        let filler = &tip.tx_ids[0];
        assert!(state.bundle_manifest(filler).is_err());
        assert_eq!(state.bundle_manifest(&tip.tx_ids[1]).unwrap().entries.len(), 1);
    }

    #[test]
    fn test_bundle_ranges_address_items() {
        let mut state = ChainState::new(shape(3, 1));
        let a = state.insert(Bytes::from_static(b"aa"), vec![], Utc::now()).unwrap();
        let b = state.insert(Bytes::from_static(b"bbb"), vec![], Utc::now()).unwrap();
        state.insert(Bytes::from_static(b"c"), vec![], Utc::now()).unwrap();

        let bundle = state.tip().tx_ids[1].clone();
        let manifest = state.bundle_manifest(&bundle).unwrap();
        let entry = manifest.find(&b.id).unwrap();
        let bytes = state
            .get_range(&bundle, entry.offset, entry.offset + entry.length)
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"bbb"));
        assert_eq!(manifest.find(&a.id).unwrap().offset, 0);
    }

    #[test]
    fn test_block_lookup_by_hash_and_height() {
        let mut state = ChainState::new(shape(1, 1));
        state.insert(Bytes::from_static(b"a"), vec![], Utc::now()).unwrap();
        let tip = state.tip().clone();

        assert_eq!(state.block_at(&BlockId::Hash(tip.hash.clone())).unwrap(), tip);
        assert_eq!(state.block_at(&BlockId::Height(1)).unwrap(), tip);
        assert!(state.block_at(&BlockId::Height(9)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_flush_finalizes_partial_bundle() {
        let mut state = ChainState::new(shape(10, 10));
        let rec = state.insert(Bytes::from_static(b"a"), vec![], Utc::now()).unwrap();
        state.flush();
        assert_eq!(state.tip().height, 1);
        assert!(state.get(&rec.id).is_ok());
    }
}
