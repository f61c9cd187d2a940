//! Trait definitions for the ledger and capture sources

pub mod ledger;
pub mod producer;

pub use ledger::{
    Block, BlockId, BlockRef, BundleEntry, BundleManifest, LedgerClient, LedgerRecord, RecordId,
    Tag, BUNDLE_MARKER_TAGS,
};
pub use producer::Producer;
