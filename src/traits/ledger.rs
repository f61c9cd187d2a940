//! Ledger client trait definition

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;

/// Opaque identifier of a record, bundle or transaction on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to a block: height plus block identifier
///
/// Wire format is a two-element array `[height, "hash"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u64, String)", into = "(u64, String)")]
pub struct BlockRef {
    pub height: u64,
    pub hash: String,
}

impl BlockRef {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// The earlier of two references (ties keep `self`)
    pub fn earliest(self, other: BlockRef) -> BlockRef {
        if other.height < self.height {
            other
        } else {
            self
        }
    }
}

impl From<(u64, String)> for BlockRef {
    fn from((height, hash): (u64, String)) -> Self {
        Self { height, hash }
    }
}

impl From<BlockRef> for (u64, String) {
    fn from(b: BlockRef) -> Self {
        (b.height, b.hash)
    }
}

/// Block lookup key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Height(u64),
    Hash(String),
}

/// A block and the transactions it carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub tx_ids: Vec<RecordId>,
}

impl Block {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.height, self.hash.clone())
    }
}

/// Name/value tag attached to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Result of persisting a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Record id
    pub id: RecordId,

    /// Block observed by the ledger at submission time
    pub block: BlockRef,

    /// Server-assigned timestamp, when the ledger reports one
    pub timestamp: Option<DateTime<Utc>>,
}

/// One payload inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub id: RecordId,
    pub offset: u64,
    pub length: u64,
}

/// Table of contents of a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub entries: Vec<BundleEntry>,
}

impl BundleManifest {
    pub fn find(&self, id: &RecordId) -> Option<&BundleEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }
}

/// Tag names that mark a transaction as a bundle
pub const BUNDLE_MARKER_TAGS: [&str; 2] = ["Bundle-Format", "Bundle-Version"];

/// Append-only, content-addressed, block-ordered store
///
/// Implementations own transport, signing and submission details. Callers
/// treat every method as potentially slow and fallible; retry policy lives
/// in [`RetryingLedger`](crate::ledger::RetryingLedger).
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Persist a payload
    ///
    /// Re-submitting identical content must fail with
    /// [`LedgerError::AlreadyRecorded`](crate::error::LedgerError::AlreadyRecorded)
    /// carrying the original id.
    async fn put(&self, data: Bytes, tags: Vec<Tag>) -> LedgerResult<LedgerRecord>;

    /// Fetch a record's payload by id
    async fn get(&self, id: &RecordId) -> LedgerResult<Bytes>;

    /// Fetch `[start, end)` of a record or bundle
    async fn get_range(&self, id: &RecordId, start: u64, end: u64) -> LedgerResult<Bytes>;

    /// Height of the current chain tip
    async fn current_height(&self) -> LedgerResult<u64>;

    /// Look up a block by height or hash
    async fn block_at(&self, block: BlockId) -> LedgerResult<Block>;

    /// Tags attached to a transaction
    async fn tags_of(&self, tx: &RecordId) -> LedgerResult<Vec<Tag>>;

    /// Transactions accepted but not yet in a block
    async fn pending_tx_ids(&self) -> LedgerResult<Vec<RecordId>>;

    /// Manifest of a bundle transaction
    async fn bundle_manifest(&self, tx: &RecordId) -> LedgerResult<BundleManifest>;

    /// Reference to the current tip block
    async fn current_block(&self) -> LedgerResult<BlockRef> {
        let height = self.current_height().await?;
        Ok(self.block_at(BlockId::Height(height)).await?.block_ref())
    }

    /// Whether a transaction's tags declare it a bundle
    fn is_container(&self, tags: &[Tag]) -> bool {
        tags.iter()
            .any(|t| BUNDLE_MARKER_TAGS.contains(&t.name.as_str()))
    }
}
