//! ledgerstream library exports
//!
//! Live byte streams are archived chunk by chunk on an append-only block
//! ledger. A chain index with logarithmic frontier records the order of
//! every chunk, and a single locator is enough to decode everything.

pub mod config;
pub mod decode;
pub mod error;
pub mod index;
pub mod ingest;
pub mod ledger;
pub mod locator;
pub mod producers;
pub mod traits;

// Re-exports
pub use config::Config;
pub use decode::{DecodeItem, Decoder, RecordResolver, ResolverConfig};
pub use error::{ArchiveError, ArchiveResult, IndexError, IngestError, LedgerError};
pub use index::{ChainIndex, Frontier, IndexNode};
pub use ingest::{IngestConfig, IngestHandle, IngestPipeline, IngestSummary};
pub use ledger::{LocalLedger, MemoryLedger, RetryConfig, RetryingLedger};
pub use locator::{Locator, LocatorSink};
pub use traits::{LedgerClient, Producer};
