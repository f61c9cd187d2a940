//! Producer trait definition

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProducerError;

/// A named source of byte chunks
///
/// Producers know nothing about the ledger or the index. `Ok(None)` marks
/// the end of the channel.
#[async_trait]
pub trait Producer: Send {
    /// Channel name the chunks are attributed to
    fn channel(&self) -> &str;

    /// Next chunk, in capture order
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProducerError>;
}
