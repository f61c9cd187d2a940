//! Producer for structured samples (location fixes, sensor readings)

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProducerError;
use crate::traits::Producer;

/// Serializes each received sample as one JSON chunk
pub struct SampleProducer<T> {
    channel: String,
    samples: mpsc::Receiver<T>,
}

impl<T> SampleProducer<T>
where
    T: Serialize + Send,
{
    /// Producer plus the sender the sampling code pushes into
    pub fn new(channel: impl Into<String>, buffer: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                channel: channel.into(),
                samples: rx,
            },
        )
    }
}

impl SampleProducer<serde_json::Value> {
    /// Samples parsed from newline-delimited JSON, e.g. a gpsd pipe
    ///
    /// Lines that are not valid JSON are skipped. The producer ends at EOF
    /// or when the reader fails.
    pub fn json_lines<R>(channel: impl Into<String>, reader: R, buffer: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, producer) = Self::new(channel, buffer);
        let channel = producer.channel.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Sample source failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(sample) => {
                        if tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Skipping malformed sample"),
                }
            }
            debug!(channel = %channel, "Sample source finished");
        });

        producer
    }
}

#[async_trait]
impl<T> Producer for SampleProducer<T>
where
    T: Serialize + Send,
{
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProducerError> {
        let Some(sample) = self.samples.recv().await else {
            return Ok(None);
        };
        let json = serde_json::to_vec(&sample).map_err(|e| ProducerError::Encode {
            channel: self.channel.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(Bytes::from(json)))
    }
}
