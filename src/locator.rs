//! Locator: the single pointer needed to resume indexing or decode a capture

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ArchiveError, ArchiveResult};
use crate::traits::{BlockRef, RecordId};

/// Pointer to the most recent index snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    /// Latest snapshot record id
    pub index: Vec<RecordId>,

    /// Block from which the snapshot can be found by scanning forward
    pub min_block: BlockRef,

    /// When the snapshot was persisted
    pub timestamp: DateTime<Utc>,

    /// SHA-256 (hex) of the snapshot payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Leaves below the snapshot
    #[serde(default)]
    pub leaves: u64,

    /// Primary bytes below the snapshot
    #[serde(default)]
    pub size: u64,
}

impl Locator {
    pub fn head(&self) -> Option<&RecordId> {
        self.index.first()
    }

    /// Read a locator file
    pub fn load(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let raw = fs::read(path.as_ref())?;
        let locator: Locator = serde_json::from_slice(&raw)?;
        if locator.index.is_empty() {
            return Err(ArchiveError::Config(format!(
                "locator {} names no index record",
                path.as_ref().display()
            )));
        }
        Ok(locator)
    }

    /// Whether `payload` matches the recorded digest (true when none is recorded)
    pub fn verify(&self, payload: &[u8]) -> bool {
        match &self.sha256 {
            Some(expected) => expected.eq_ignore_ascii_case(&digest_hex(payload)),
            None => true,
        }
    }
}

/// Hex SHA-256 of a payload
pub fn digest_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Writes each new locator to its file and echoes it as a JSON line
///
/// The file is named after the first locator written through the sink and
/// is replaced atomically on every update.
pub struct LocatorSink {
    dir: PathBuf,
    path: Option<PathBuf>,
    echo: Option<Box<dyn Write + Send>>,
}

impl LocatorSink {
    /// Sink writing under `dir` and echoing to stdout
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            path: None,
            echo: Some(Box::new(io::stdout())),
        }
    }

    /// Keep overwriting an existing locator file
    pub fn resume_at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir,
            path: Some(path),
            echo: Some(Box::new(io::stdout())),
        }
    }

    pub fn with_echo(mut self, echo: Box<dyn Write + Send>) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echo = None;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Echo and persist a locator
    pub fn write(&mut self, locator: &Locator) -> io::Result<PathBuf> {
        let line = serde_json::to_string(locator).map_err(io::Error::other)?;

        if let Some(echo) = self.echo.as_mut() {
            writeln!(echo, "{line}")?;
            echo.flush()?;
        }

        let path = match &self.path {
            Some(path) => path.clone(),
            None => {
                let head = locator.head().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "locator has no index record")
                })?;
                let path = self.dir.join(format!("{head}.json"));
                self.path = Some(path.clone());
                path
            }
        };

        fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, line.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}
