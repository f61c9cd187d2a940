//! Chain index over captured chunks
//!
//! The frontier is the right edge of a balanced multiway tree. Appends
//! either extend it or fold a suffix into one internal node whose content
//! is persisted to the ledger and referenced by id.

pub mod chain;
pub mod frontier;
pub mod node;

pub use chain::{ChainIndex, IndexCheckpoint};
pub use frontier::{Frontier, MergePoint};
pub use node::{
    ChannelEntry, DropMarker, IndexNode, IndexRecord, InternalNode, LeafNode, LeafPayload,
    INDEX_RECORD_VERSION,
};
