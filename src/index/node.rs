//! Index node types and their wire format

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};
use crate::traits::{BlockRef, RecordId};

/// Current version of the index record format
pub const INDEX_RECORD_VERSION: u32 = 1;

/// Gap left by the drop-oldest admission policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropMarker {
    /// Chunks discarded
    pub count: u64,

    /// Bytes discarded
    pub bytes: u64,

    /// Capture time of the oldest discarded chunk
    pub since: DateTime<Utc>,
}

impl DropMarker {
    pub fn new(bytes: u64, since: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            bytes,
            since,
        }
    }

    /// Fold another discarded chunk into the marker
    pub fn record(&mut self, bytes: u64, since: DateTime<Utc>) {
        self.count += 1;
        self.bytes += bytes;
        if since < self.since {
            self.since = since;
        }
    }

    /// Combine two markers for the same channel
    pub fn merge(&mut self, other: DropMarker) {
        self.count += other.count;
        self.bytes += other.bytes;
        if other.since < self.since {
            self.since = other.since;
        }
    }
}

/// Chunks of one channel folded into a leaf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Chunk records in capture order
    pub records: Vec<RecordId>,

    /// Capture instant of each chunk, parallel to `records`
    pub times: Vec<DateTime<Utc>>,

    /// Total bytes across `records`
    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped: Option<DropMarker>,

    /// Producer failure noted on this channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ChannelEntry {
    pub fn push(&mut self, id: RecordId, captured_at: DateTime<Utc>, len: u64) {
        self.records.push(id);
        self.times.push(captured_at);
        self.length += len;
    }

    pub fn is_annotation_only(&self) -> bool {
        self.records.is_empty()
    }
}

/// Content of a leaf before it enters the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafPayload {
    pub channels: BTreeMap<String, ChannelEntry>,
    pub min_block: BlockRef,
}

impl LeafPayload {
    pub fn new(min_block: BlockRef) -> Self {
        Self {
            channels: BTreeMap::new(),
            min_block,
        }
    }

    /// Bytes recorded on `channel`
    pub fn channel_len(&self, channel: &str) -> u64 {
        self.channels.get(channel).map_or(0, |c| c.length)
    }

    pub fn chunk_count(&self) -> usize {
        self.channels.values().map(|c| c.records.len()).sum()
    }
}

/// One batch of chunks; always weight 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    /// Primary channel bytes in this leaf
    pub size: u64,
    pub channels: BTreeMap<String, ChannelEntry>,
    pub min_block: BlockRef,
}

impl LeafNode {
    pub fn new(size: u64, payload: LeafPayload) -> Self {
        Self {
            size,
            channels: payload.channels,
            min_block: payload.min_block,
        }
    }
}

/// Summary of a persisted frontier segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalNode {
    pub weight: u64,
    pub size: u64,

    #[serde(rename = "ref")]
    pub reference: RecordId,

    /// Earliest block at which the segment or its descendants can appear
    pub min_block: BlockRef,
}

/// Entry of a frontier or of a persisted segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl IndexNode {
    pub fn weight(&self) -> u64 {
        match self {
            IndexNode::Leaf(_) => 1,
            IndexNode::Internal(n) => n.weight,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            IndexNode::Leaf(n) => n.size,
            IndexNode::Internal(n) => n.size,
        }
    }

    pub fn min_block(&self) -> &BlockRef {
        match self {
            IndexNode::Leaf(n) => &n.min_block,
            IndexNode::Internal(n) => &n.min_block,
        }
    }
}

/// Payload stored on the ledger for a segment or a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub version: u32,
    pub nodes: Vec<IndexNode>,
}

impl IndexRecord {
    pub fn new(nodes: Vec<IndexNode>) -> Self {
        Self {
            version: INDEX_RECORD_VERSION,
            nodes,
        }
    }

    pub fn to_bytes(&self) -> IndexResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| IndexError::Invariant(format!("index record not serializable: {e}")))
    }

    /// Parse a record fetched for `id`
    pub fn from_bytes(id: &RecordId, data: &[u8]) -> IndexResult<Self> {
        let record: IndexRecord =
            serde_json::from_slice(data).map_err(|e| IndexError::MalformedRecord {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        if record.version != INDEX_RECORD_VERSION {
            return Err(IndexError::MalformedRecord {
                id: id.clone(),
                reason: format!("unsupported version {}", record.version),
            });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> BlockRef {
        BlockRef::new(12, "h12")
    }

    #[test]
    fn test_leaf_wire_format() {
        let mut payload = LeafPayload::new(block());
        let mut entry = ChannelEntry::default();
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        entry.push(RecordId::new("r1"), at, 5);
        payload.channels.insert("capture".into(), entry);

        let node = IndexNode::Leaf(LeafNode::new(5, payload));
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["kind"], "leaf");
        assert_eq!(json["size"], 5);
        assert_eq!(json["min_block"], serde_json::json!([12, "h12"]));
        assert_eq!(json["channels"]["capture"]["records"][0], "r1");
        assert!(json["channels"]["capture"].get("dropped").is_none());
    }

    #[test]
    fn test_internal_uses_ref_field() {
        let node = IndexNode::Internal(InternalNode {
            weight: 4,
            size: 100,
            reference: RecordId::new("seg"),
            min_block: block(),
        });
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_eq!(json["ref"], "seg");
        assert_eq!(node.weight(), 4);
    }

    #[test]
    fn test_record_rejects_unknown_version() {
        let data = br#"{"version":9,"nodes":[]}"#;
        let err = IndexRecord::from_bytes(&RecordId::new("x"), data).unwrap_err();
        assert!(matches!(err, IndexError::MalformedRecord { .. }));
    }

    #[test]
    fn test_record_rejects_garbage() {
        let err = IndexRecord::from_bytes(&RecordId::new("x"), b"\x00\x01").unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_drop_marker_accumulates() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let mut marker = DropMarker::new(10, t1);
        marker.record(5, t0);
        assert_eq!(marker.count, 2);
        assert_eq!(marker.bytes, 15);
        assert_eq!(marker.since, t0);

        marker.merge(DropMarker::new(1, t1));
        assert_eq!(marker.count, 3);
    }
}
