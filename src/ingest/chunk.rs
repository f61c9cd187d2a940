//! Units of work flowing through the ingest pipeline

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::LedgerError;
use crate::index::DropMarker;
use crate::traits::LedgerRecord;

/// A chunk taken from the intake, numbered in admission order
#[derive(Debug, Clone)]
pub struct Chunk {
    pub seq: u64,
    pub channel: String,
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What a worker reports for one chunk
#[derive(Debug)]
pub struct Upload {
    pub seq: u64,
    pub channel: String,
    pub captured_at: DateTime<Utc>,
    pub len: u64,
    pub outcome: Result<LedgerRecord, LedgerError>,
}

impl Upload {
    pub fn bytes(&self) -> u64 {
        self.len
    }
}

/// Out-of-band notes for a channel, attached to the next leaf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    pub dropped: Option<DropMarker>,
    pub failures: Vec<String>,
}

impl Annotation {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_none() && self.failures.is_empty()
    }

    pub fn note_drop(&mut self, bytes: u64, since: DateTime<Utc>) {
        match self.dropped.as_mut() {
            Some(marker) => marker.record(bytes, since),
            None => self.dropped = Some(DropMarker::new(bytes, since)),
        }
    }

    pub fn merge(&mut self, other: Annotation) {
        if let Some(marker) = other.dropped {
            match self.dropped.as_mut() {
                Some(mine) => mine.merge(marker),
                None => self.dropped = Some(marker),
            }
        }
        self.failures.extend(other.failures);
    }

    /// Failure notes joined for the leaf's `failure` field
    pub fn failure_text(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(self.failures.join("; "))
        }
    }
}
