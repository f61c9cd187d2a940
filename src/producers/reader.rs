//! Producer over any async byte reader

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProducerError;
use crate::traits::Producer;

/// Default read size per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Reads a stream into chunks of at most `chunk_size` bytes
///
/// A chunk is emitted as soon as a read returns data, so a slow source
/// produces small chunks instead of waiting to fill a buffer.
pub struct ReaderProducer<R> {
    channel: String,
    reader: R,
    chunk_size: usize,
}

impl<R> ReaderProducer<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(channel: impl Into<String>, reader: R) -> Self {
        Self {
            channel: channel.into(),
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl<R> Producer for ReaderProducer<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProducerError> {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let n = self
            .reader
            .read(&mut buf)
            .await
            .map_err(|source| ProducerError::Read {
                channel: self.channel.clone(),
                source,
            })?;

        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }
}
