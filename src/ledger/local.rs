//! Durable single-node ledger backed by an append-only journal
//!
//! Every accepted payload and every explicit flush is appended to
//! `journal.jsonl`; reopening the directory replays the journal, which
//! reproduces the same bundles, blocks and ids.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::state::{record_id, ChainShape, ChainState};
use crate::error::{LedgerError, LedgerResult};
use crate::traits::{Block, BlockId, BundleManifest, LedgerClient, LedgerRecord, RecordId, Tag};

const JOURNAL_FILE: &str = "journal.jsonl";
const SHAPE_FILE: &str = "ledger.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JournalEvent {
    Put {
        data: String,
        tags: Vec<Tag>,
        at: DateTime<Utc>,
    },
    Flush,
}

struct Inner {
    state: ChainState,
    journal: File,
}

/// Journal-backed ledger rooted at a directory
pub struct LocalLedger {
    dir: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl LocalLedger {
    /// Open or create a ledger directory
    ///
    /// The bundling shape is fixed when the directory is created; `shape`
    /// is ignored for an existing ledger.
    pub fn open(dir: impl AsRef<Path>, shape: ChainShape) -> LedgerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let shape_path = dir.join(SHAPE_FILE);
        let shape = if shape_path.exists() {
            let raw = fs::read(&shape_path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| LedgerError::InvalidResponse(format!("{SHAPE_FILE}: {e}")))?
        } else {
            let raw = serde_json::to_vec_pretty(&shape)
                .map_err(|e| LedgerError::Io(e.to_string()))?;
            fs::write(&shape_path, raw)?;
            shape
        };

        let journal_path = dir.join(JOURNAL_FILE);
        let mut state = ChainState::new(shape);
        let (replayed, torn) = if journal_path.exists() {
            replay(&journal_path, &mut state)?
        } else {
            (0, false)
        };

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        if torn {
            journal.write_all(b"\n")?;
        }

        info!(
            dir = %dir.display(),
            events = replayed,
            height = state.tip().height,
            "Opened local ledger"
        );

        Ok(Self {
            dir,
            inner: Arc::new(Mutex::new(Inner { state, journal })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Post the open bundle and mine everything pending
    pub async fn flush(&self) -> LedgerResult<()> {
        self.journaled(|inner| {
            append_event(&mut inner.journal, &JournalEvent::Flush)?;
            inner.state.flush();
            Ok(())
        })
        .await
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> LedgerResult<T>) -> LedgerResult<T> {
        f(&mut *lock(&self.inner)?)
    }

    /// Run a step that writes the journal on the blocking pool
    async fn journaled<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner) -> LedgerResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&mut *lock(&inner)?))
            .await
            .map_err(|e| LedgerError::Io(format!("journal task failed: {e}")))?
    }
}

fn lock(inner: &Mutex<Inner>) -> LedgerResult<MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| LedgerError::Io("ledger state lock poisoned".into()))
}

fn append_event(journal: &mut File, event: &JournalEvent) -> LedgerResult<()> {
    let mut line = serde_json::to_vec(event).map_err(|e| LedgerError::Io(e.to_string()))?;
    line.push(b'\n');
    journal.write_all(&line)?;
    journal.sync_data()?;
    Ok(())
}

/// Apply journal events; also reports whether the last line is unterminated
fn replay(path: &Path, state: &mut ChainState) -> LedgerResult<(usize, bool)> {
    let raw = fs::read_to_string(path)?;
    let torn = !raw.is_empty() && !raw.ends_with('\n');
    let mut applied = 0;

    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: JournalEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                // A torn final write is expected after a crash
                warn!(line = lineno + 1, error = %e, "Ignoring unreadable journal entry");
                continue;
            }
        };

        match event {
            JournalEvent::Put { data, tags, at } => {
                let data = STANDARD
                    .decode(data)
                    .map_err(|e| LedgerError::InvalidResponse(format!("journal line {}: {e}", lineno + 1)))?;
                match state.insert(Bytes::from(data), tags, at) {
                    Ok(_) | Err(LedgerError::AlreadyRecorded(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            JournalEvent::Flush => state.flush(),
        }
        applied += 1;
    }

    Ok((applied, torn))
}

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn put(&self, data: Bytes, tags: Vec<Tag>) -> LedgerResult<LedgerRecord> {
        self.journaled(move |inner| {
            let id = record_id(&data, &tags);
            if inner.state.contains(&id) {
                return Err(LedgerError::AlreadyRecorded(id));
            }

            // only journaled payloads become visible
            let at = Utc::now();
            let event = JournalEvent::Put {
                data: STANDARD.encode(&data),
                tags: tags.clone(),
                at,
            };
            append_event(&mut inner.journal, &event)?;
            inner.state.insert(data, tags, at)
        })
        .await
    }

    async fn get(&self, id: &RecordId) -> LedgerResult<Bytes> {
        self.with_inner(|inner| inner.state.get(id))
    }

    async fn get_range(&self, id: &RecordId, start: u64, end: u64) -> LedgerResult<Bytes> {
        self.with_inner(|inner| inner.state.get_range(id, start, end))
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        self.with_inner(|inner| Ok(inner.state.tip().height))
    }

    async fn block_at(&self, block: BlockId) -> LedgerResult<Block> {
        self.with_inner(|inner| inner.state.block_at(&block))
    }

    async fn tags_of(&self, tx: &RecordId) -> LedgerResult<Vec<Tag>> {
        self.with_inner(|inner| inner.state.tags_of(tx))
    }

    async fn pending_tx_ids(&self) -> LedgerResult<Vec<RecordId>> {
        self.with_inner(|inner| Ok(inner.state.pending()))
    }

    async fn bundle_manifest(&self, tx: &RecordId) -> LedgerResult<BundleManifest> {
        self.with_inner(|inner| inner.state.bundle_manifest(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shape() -> ChainShape {
        ChainShape {
            items_per_bundle: 2,
            bundles_per_block: 1,
        }
    }

    #[tokio::test]
    async fn test_reopen_replays_payloads_and_blocks() {
        let dir = TempDir::new().unwrap();

        let (id, height) = {
            let ledger = LocalLedger::open(dir.path(), shape()).unwrap();
            let rec = ledger.put(Bytes::from_static(b"a"), vec![]).await.unwrap();
            ledger.put(Bytes::from_static(b"b"), vec![]).await.unwrap();
            ledger.put(Bytes::from_static(b"c"), vec![]).await.unwrap();
            ledger.flush().await.unwrap();
            (rec.id, ledger.current_height().await.unwrap())
        };

        let ledger = LocalLedger::open(dir.path(), ChainShape::default()).unwrap();
        assert_eq!(ledger.current_height().await.unwrap(), height);
        assert_eq!(ledger.get(&id).await.unwrap(), Bytes::from_static(b"a"));

        let tip = ledger.block_at(BlockId::Height(height)).await.unwrap();
        let reopened_tip = ledger.current_block().await.unwrap();
        assert_eq!(tip.block_ref(), reopened_tip);
    }

    #[tokio::test]
    async fn test_duplicates_are_not_journaled() {
        let dir = TempDir::new().unwrap();
        let ledger = LocalLedger::open(dir.path(), shape()).unwrap();

        ledger.put(Bytes::from_static(b"a"), vec![]).await.unwrap();
        let err = ledger.put(Bytes::from_static(b"a"), vec![]).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyRecorded(_)));

        let journal = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_journal_write_leaves_payload_unrecorded() {
        let dir = TempDir::new().unwrap();
        let ledger = LocalLedger::open(dir.path(), shape()).unwrap();
        ledger.inner.lock().unwrap().journal = OpenOptions::new()
            .write(true)
            .open("/dev/full")
            .unwrap();

        let data = Bytes::from_static(b"a");
        let err = ledger.put(data.clone(), vec![]).await.unwrap_err();
        assert!(matches!(err, LedgerError::Io(_)));

        let id = record_id(&data, &[]);
        assert!(ledger.get(&id).await.is_err());
        assert!(ledger.pending_tx_ids().await.unwrap().is_empty());

        // the journal is usable again and the same payload is accepted
        ledger.inner.lock().unwrap().journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        let record = ledger.put(data, vec![]).await.unwrap();
        assert_eq!(record.id, id);

        drop(ledger);
        let reopened = LocalLedger::open(dir.path(), shape()).unwrap();
        assert_eq!(reopened.get(&id).await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = LocalLedger::open(dir.path(), shape()).unwrap();
            ledger.put(Bytes::from_static(b"a"), vec![]).await.unwrap();
        }
        let mut journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        journal.write_all(b"{\"event\":\"pu").unwrap();

        let ledger = LocalLedger::open(dir.path(), shape()).unwrap();
        // the stored payload is still in the open bundle
        ledger.flush().await.unwrap();
        assert_eq!(ledger.current_height().await.unwrap(), 1);
    }
}
