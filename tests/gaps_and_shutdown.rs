//! Gaps recorded for dropped chunks and failed sources, and shutdown draining

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use futures::StreamExt;
use ledgerstream::decode::{DecodeItem, Decoder};
use ledgerstream::error::IngestError;
use ledgerstream::ingest::{send_all, DropPolicy, IngestConfig};
use ledgerstream::producers::CommandProducer;
use ledgerstream::MemoryLedger;

async fn decode_items(
    ledger: Arc<MemoryLedger>,
    locator: &ledgerstream::Locator,
) -> Vec<DecodeItem> {
    Decoder::from_locator(quick_resolver(ledger), locator, "capture")
        .await
        .unwrap()
        .into_stream()
        .map(|item| item.expect("decode succeeds"))
        .collect()
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_oldest_leaves_markers_that_account_for_every_chunk() {
    let ledger = Arc::new(MemoryLedger::instant().with_latency(15..20, 3));
    let config = IngestConfig {
        channel_capacity: 1,
        min_workers: 1,
        max_workers: 1,
        worker_batch: 1,
        ..test_config(2)
    };
    let pipeline = start_pipeline(ledger.clone(), config);

    let sender = pipeline.handle.channel_with_policy(
        "capture",
        DropPolicy::DropOldest {
            after: Duration::ZERO,
        },
    );
    for chunk in make_chunks(20, 4) {
        sender.send(chunk).await.unwrap();
    }
    drop(sender);

    let summary = pipeline.finish().await;
    assert!(summary.dropped > 0, "a one-slot queue must overflow");

    let items = decode_items(ledger, summary.locator.as_ref().unwrap()).await;
    let kept = items
        .iter()
        .filter(|item| matches!(item, DecodeItem::Chunk(_)))
        .count() as u64;
    let marked: u64 = items
        .iter()
        .filter_map(|item| match item {
            DecodeItem::Gap(gap) => gap.dropped.as_ref().map(|m| m.count),
            _ => None,
        })
        .sum();

    assert_eq!(marked, summary.dropped);
    assert_eq!(kept + marked, 20);
}

#[tokio::test]
async fn test_recorded_source_failure_decodes_as_gap() {
    let ledger = Arc::new(MemoryLedger::instant());
    let pipeline = start_pipeline(ledger.clone(), test_config(2));

    send_all(&pipeline.handle, "capture", make_chunks(5, 8))
        .await
        .unwrap();
    let sensor = pipeline.handle.channel("sensor");
    sensor.record_failure("sensor offline");
    drop(sensor);

    let summary = pipeline.finish().await;
    let items = decode_items(ledger, summary.locator.as_ref().unwrap()).await;

    let gaps: Vec<_> = items
        .iter()
        .filter_map(|item| match item {
            DecodeItem::Gap(gap) => Some(gap),
            _ => None,
        })
        .collect();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].channel, "sensor");
    assert_eq!(gaps[0].failure.as_deref(), Some("sensor offline"));
    assert!(gaps[0].dropped.is_none());
}

#[tokio::test]
async fn test_failing_command_is_recorded_on_its_channel() {
    let ledger = Arc::new(MemoryLedger::instant());
    let pipeline = start_pipeline(ledger.clone(), test_config(2));

    let producer = CommandProducer::spawn("tool", "printf abc; exit 3")
        .expect("shell available");
    pipeline
        .handle
        .spawn_producer(Box::new(producer))
        .await
        .unwrap();
    send_all(&pipeline.handle, "capture", vec![Bytes::from_static(b"primary")])
        .await
        .unwrap();

    let summary = pipeline.finish().await;
    let channels = decode_channels(ledger.clone(), summary.locator.as_ref().unwrap(), "capture").await;
    assert_eq!(channels["tool"], b"abc".to_vec());
    assert_eq!(channels["capture"], b"primary".to_vec());

    let items = decode_items(ledger, summary.locator.as_ref().unwrap()).await;
    let failure = items.iter().find_map(|item| match item {
        DecodeItem::Gap(gap) if gap.channel == "tool" => gap.failure.clone(),
        _ => None,
    });
    assert!(failure.is_some(), "non-zero exit must leave a gap");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_signal_drains_backlog_and_rejects_new_chunks() {
    let ledger = Arc::new(MemoryLedger::instant().with_latency(1..5, 11));
    let pipeline = start_pipeline(ledger.clone(), test_config(3));

    let chunks = make_chunks(30, 21);
    let sender = pipeline.handle.channel("capture");
    for chunk in chunks.iter().cloned() {
        sender.send(chunk).await.unwrap();
    }

    pipeline.shutdown.send(()).unwrap();
    sender.closed().await;
    assert!(pipeline.handle.is_closed());
    assert!(matches!(
        sender.send(Bytes::from_static(b"late")).await,
        Err(IngestError::Closed)
    ));
    drop(sender);

    let summary = pipeline.finish().await;
    assert_eq!(summary.chunks, 30);

    let channels = decode_channels(ledger, summary.locator.as_ref().unwrap(), "capture").await;
    assert_same_bytes(&channels["capture"], &chunks.concat());
}
