//! Producer over the standard output of a child process

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use super::reader::ReaderProducer;
use crate::error::ProducerError;
use crate::traits::Producer;

/// Runs a shell command and captures its stdout
///
/// The child is killed when the producer is dropped. A non-zero exit is
/// reported as a read failure after the last chunk.
pub struct CommandProducer {
    command: String,
    child: Child,
    reader: ReaderProducer<ChildStdout>,
}

impl CommandProducer {
    /// Spawn `command` through `sh -c`
    pub fn spawn(channel: impl Into<String>, command: impl Into<String>) -> Result<Self, ProducerError> {
        let channel = channel.into();
        let command = command.into();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProducerError::Start {
                channel: channel.clone(),
                reason: format!("{command}: {e}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ProducerError::Start {
            channel: channel.clone(),
            reason: format!("{command}: stdout not captured"),
        })?;

        info!(channel = %channel, command = %command, pid = child.id(), "Started capture command");
        Ok(Self {
            command,
            child,
            reader: ReaderProducer::new(channel, stdout),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.reader = self.reader.with_chunk_size(chunk_size);
        self
    }
}

#[async_trait]
impl Producer for CommandProducer {
    fn channel(&self) -> &str {
        self.reader.channel()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProducerError> {
        if let Some(chunk) = self.reader.next_chunk().await? {
            return Ok(Some(chunk));
        }

        let channel = self.reader.channel().to_string();
        let status = self.child.wait().await.map_err(|source| ProducerError::Read {
            channel: channel.clone(),
            source,
        })?;
        debug!(channel = %channel, %status, "Capture command exited");

        if status.success() {
            Ok(None)
        } else {
            Err(ProducerError::Read {
                channel,
                source: std::io::Error::other(format!("`{}` exited with {status}", self.command)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut producer = CommandProducer::spawn("logs", "printf 'one\\ntwo\\n'").unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = producer.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let mut producer = CommandProducer::spawn("logs", "printf x; exit 3").unwrap();
        assert_eq!(producer.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"x"));

        let err = producer.next_chunk().await.unwrap_err();
        assert!(err.to_string().contains("logs"));
    }
}
