//! Ingest pipeline
//!
//! Producers admit chunks into a bounded intake. Upload workers persist
//! them concurrently; a single consumer restores admission order and
//! commits contiguous runs to the chain index, emitting a locator after
//! every commit.

pub mod blocks;
pub mod chunk;
pub mod commit;
pub mod config;
pub mod core;
pub mod intake;
pub mod pool;
pub mod reorder;

pub use blocks::BlockTracker;
pub use chunk::{Annotation, Chunk, Upload};
pub use commit::commit_batch;
pub use config::{DropPolicy, IngestConfig};
pub use self::core::{send_all, IngestHandle, IngestPipeline, IngestSummary};
pub use intake::{ChannelSender, Intake, Work};
pub use pool::{PoolCounters, WorkerPool};
pub use reorder::ReorderBuffer;
