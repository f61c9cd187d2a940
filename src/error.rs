//! Error types for ledger access, indexing, ingest and decoding

use thiserror::Error;

use crate::traits::RecordId;

/// Errors surfaced by a [`LedgerClient`](crate::traits::LedgerClient)
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    // ========== Transient ==========
    /// Network communication error
    #[error("network error: {0}")]
    Network(String),

    /// Request timeout
    #[error("timeout after {0} ms")]
    Timeout(u64),

    /// Ledger or gateway temporarily unavailable
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Rate limited by the ledger network
    #[error("rate limited: {0}")]
    RateLimited(String),

    // ========== Content ==========
    /// Record, block or bundle not (yet) visible
    #[error("not found: {0}")]
    NotFound(String),

    /// Payload was already recorded under this id
    #[error("already recorded: {0}")]
    AlreadyRecorded(RecordId),

    // ========== Permanent ==========
    /// Ledger refused the submission
    #[error("rejected: {0}")]
    Rejected(String),

    /// Response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Local I/O failure inside a ledger backend
    #[error("I/O error: {0}")]
    Io(String),
}

impl LedgerError {
    /// Whether the error is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Network(_)
                | LedgerError::Timeout(_)
                | LedgerError::Unavailable(_)
                | LedgerError::RateLimited(_)
        )
    }

    /// Whether the error means content is not visible yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Io(e.to_string())
    }
}

/// Chain index and traversal errors
///
/// Everything except `Ledger` indicates structural corruption or a bug and
/// is fatal for the operation in progress.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Merge degree below 2
    #[error("invalid merge degree {0}: must be at least 2")]
    InvalidDegree(u64),

    /// A record id was reached twice during a traversal
    #[error("record {id} visited twice (stream offset {offset})")]
    DuplicateVisit { id: RecordId, offset: u64 },

    /// A child started at a different stream offset than the traversal expected
    #[error("node at position {position} reached with stream offset {offset}")]
    OffsetMismatch { position: u64, offset: u64 },

    /// A subtree's children did not add up to its declared extent
    #[error("subtree {origin} declares [{start}, +{size}) but children ended at {actual}")]
    ExtentMismatch {
        origin: String,
        start: u64,
        size: u64,
        actual: u64,
    },

    /// Primary channel bytes of a leaf differ from the declared leaf size
    #[error("leaf at offset {offset} declares {declared} bytes but records hold {actual}")]
    ChannelSizeMismatch {
        offset: u64,
        declared: u64,
        actual: u64,
    },

    /// Index record could not be parsed or fails an integrity check
    #[error("malformed index record {id}: {reason}")]
    MalformedRecord { id: RecordId, reason: String },

    /// The merge invariant of the frontier does not hold
    #[error("frontier invariant violated: {0}")]
    Invariant(String),

    /// Reading or writing index content on the ledger failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl IndexError {
    /// Structural errors are never retried
    pub fn is_structural(&self) -> bool {
        !matches!(self, IndexError::Ledger(_))
    }
}

/// Ingest pipeline errors
#[derive(Debug, Error)]
pub enum IngestError {
    /// The pipeline no longer admits chunks
    #[error("pipeline closed")]
    Closed,

    /// A chunk could not be persisted
    #[error("upload of chunk {seq} failed: {source}")]
    Upload { seq: u64, source: LedgerError },

    /// Results ended while a sequence number was still missing
    #[error("sequence gap: expected {expected}, {pending} results stranded")]
    SequenceGap { expected: u64, pending: usize },

    /// Batch commit exhausted its retries
    #[error("batch commit failed after {attempts} attempts: {source}")]
    Commit { attempts: u32, source: IndexError },

    /// The ledger could not be reached to start the pipeline
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

/// Producer-side errors (isolated to one channel)
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Capture source could not be started
    #[error("failed to start {channel}: {reason}")]
    Start { channel: String, reason: String },

    /// Read from the capture source failed
    #[error("read failed on {channel}: {source}")]
    Read {
        channel: String,
        source: std::io::Error,
    },

    /// Structured sample could not be serialized
    #[error("encode failed on {channel}: {reason}")]
    Encode { channel: String, reason: String },
}

/// Top-level error type
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ArchiveError {
    /// Whether the error indicates corrupt data or a broken invariant
    pub fn is_structural(&self) -> bool {
        match self {
            ArchiveError::Index(e) => e.is_structural(),
            ArchiveError::Ingest(IngestError::SequenceGap { .. }) => true,
            ArchiveError::Ingest(IngestError::Commit { source, .. }) => source.is_structural(),
            _ => false,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
pub type IndexResult<T> = Result<T, IndexError>;
pub type ArchiveResult<T> = Result<T, ArchiveError>;
