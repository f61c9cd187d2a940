//! Capture into a journal-backed ledger, reopen it and resume

mod common;

use common::*;
use ledgerstream::index::ChainIndex;
use ledgerstream::ingest::{send_all, IngestPipeline};
use ledgerstream::ledger::{ChainShape, LocalLedger};
use ledgerstream::locator::{Locator, LocatorSink};
use ledgerstream::traits::{LedgerClient, Tag};
use tempfile::TempDir;
use tokio::sync::broadcast;

const SHAPE: ChainShape = ChainShape {
    items_per_bundle: 4,
    bundles_per_block: 2,
};

async fn capture(
    ledger: Arc<LocalLedger>,
    index: ChainIndex,
    sink: LocatorSink,
    chunks: Vec<bytes::Bytes>,
) -> Locator {
    let (_shutdown, rx) = broadcast::channel(1);
    let (handle, task) = IngestPipeline::new(ledger.clone(), index, test_config(3))
        .with_sink(sink.without_echo())
        .start(rx);
    send_all(&handle, "capture", chunks).await.unwrap();
    drop(handle);

    let summary = task.await.unwrap().unwrap();
    ledger.flush().await.unwrap();
    summary.locator.expect("locator emitted")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_survives_reopen_and_resumes_from_locator_file() {
    let dir = TempDir::new().unwrap();
    let ledger_dir = dir.path().join("ledger");
    let locator_dir = dir.path().join("locators");

    let first = make_chunks(25, 31);
    let ledger = Arc::new(LocalLedger::open(&ledger_dir, SHAPE).unwrap());
    let index = ChainIndex::new(ledger.clone(), 3).unwrap();
    let locator = capture(ledger, index, LocatorSink::new(&locator_dir), first.clone()).await;

    let path = locator_dir.join(format!("{}.json", locator.head().unwrap()));
    assert_eq!(Locator::load(&path).unwrap(), locator);

    // Reopen from the journal only
    let ledger = Arc::new(LocalLedger::open(&ledger_dir, ChainShape::default()).unwrap());
    let channels = decode_channels(ledger.clone(), &locator, "capture").await;
    assert_same_bytes(&channels["capture"], &first.concat());

    let saved = Locator::load(&path).unwrap();
    let mut resolver = quick_resolver(ledger.clone());
    let index = ChainIndex::resume(ledger.clone(), 3, &saved, &mut resolver)
        .await
        .unwrap();

    let second = make_chunks(10, 32);
    let resumed = capture(
        ledger.clone(),
        index,
        LocatorSink::resume_at(&path),
        second.clone(),
    )
    .await;
    assert!(resumed.leaves > saved.leaves);
    assert_eq!(
        resumed.size,
        saved.size + second.iter().map(|c| c.len() as u64).sum::<u64>()
    );
    assert_eq!(Locator::load(&path).unwrap(), resumed);

    let channels = decode_channels(ledger, &resumed, "capture").await;
    let expected = [first.concat(), second.concat()].concat();
    assert_same_bytes(&channels["capture"], &expected);
}

#[tokio::test]
async fn test_reopened_ledger_reports_same_tip() {
    let dir = TempDir::new().unwrap();
    let ledger = LocalLedger::open(dir.path(), SHAPE).unwrap();
    let mut records = Vec::new();
    for chunk in make_chunks(9, 40) {
        let record = ledger
            .put(chunk, vec![Tag::new("Channel", "capture")])
            .await
            .unwrap();
        records.push(record);
    }
    ledger.flush().await.unwrap();
    let tip = ledger.current_block().await.unwrap();
    drop(ledger);

    let reopened = LocalLedger::open(dir.path(), SHAPE).unwrap();
    assert_eq!(reopened.current_block().await.unwrap(), tip);
    for record in &records {
        assert!(reopened.get(&record.id).await.is_ok());
    }
}
