//! ledgerstream - capture live byte streams onto a ledger and decode them back

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerstream::decode::{DecodeItem, Decoder, RecordResolver};
use ledgerstream::error::ArchiveError;
use ledgerstream::index::ChainIndex;
use ledgerstream::ingest::{DropPolicy, IngestPipeline};
use ledgerstream::ledger::{LocalLedger, RetryingLedger};
use ledgerstream::locator::{Locator, LocatorSink};
use ledgerstream::producers::{CommandProducer, ReaderProducer, SampleProducer, DEFAULT_CHUNK_SIZE};
use ledgerstream::traits::LedgerClient;
use ledgerstream::Config;

#[derive(Parser, Debug)]
#[command(name = "ledgerstream")]
#[command(about = "Archive live byte streams on an append-only ledger with a logarithmic index")]
#[command(version)]
struct Args {
    /// Log level or filter directives
    #[arg(long, env = "LEDGERSTREAM_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Directory of the local ledger
    #[arg(long, env = "LEDGERSTREAM_LEDGER_DIR", default_value = "./ledger", global = true)]
    ledger_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture channels until they end or the process is interrupted
    Capture(CaptureArgs),

    /// Reproduce the channels recorded under a locator
    Decode(DecodeArgs),
}

#[derive(clap::Args, Debug)]
struct CaptureArgs {
    /// Directory locator files are written to
    #[arg(long, env = "LEDGERSTREAM_LOCATOR_DIR", default_value = "./locators")]
    locator_dir: PathBuf,

    /// Capture standard input as the primary channel
    #[arg(long)]
    stdin: bool,

    /// Extra channel fed by a shell command (repeatable)
    #[arg(long = "channel", value_name = "NAME=COMMAND", value_parser = parse_channel)]
    channels: Vec<(String, String)>,

    /// Channel of JSON-line samples read from a file or FIFO (repeatable)
    #[arg(long = "samples", value_name = "NAME=PATH", value_parser = parse_channel)]
    samples: Vec<(String, String)>,

    /// Name of the primary channel
    #[arg(long)]
    primary: Option<String>,

    /// Merge degree of the chain index
    #[arg(long)]
    degree: Option<u64>,

    /// Workers kept alive while producers run
    #[arg(long)]
    min_workers: Option<usize>,

    /// Upper bound on concurrent upload workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Drop the oldest queued chunk after waiting this long on a full queue
    #[arg(long)]
    drop_oldest_after_ms: Option<u64>,

    /// Bytes read per chunk from stdin and commands
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Continue the index recorded in an existing locator file
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DecodeArgs {
    /// Locator file written by a capture
    locator: PathBuf,

    /// Name of the primary channel
    #[arg(long)]
    primary: Option<String>,

    /// Write auxiliary channels to <DIR>/<channel>.bin instead of logging them
    #[arg(long)]
    aux_dir: Option<PathBuf>,

    /// Give up on a missing record after this many scan passes
    #[arg(long)]
    max_passes: Option<u32>,
}

fn parse_channel(s: &str) -> Result<(String, String), String> {
    let (name, command) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=COMMAND, got `{s}`"))?;
    let name = name.trim();
    if name.is_empty() || command.trim().is_empty() {
        return Err(format!("expected NAME=COMMAND, got `{s}`"));
    }
    Ok((name.to_string(), command.to_string()))
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async {
        match run(args).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %format!("{e:#}"), "ledgerstream failed");
                ExitCode::FAILURE
            }
        }
    });

    // A blocking stdin read may still be parked
    runtime.shutdown_timeout(Duration::from_millis(500));
    code
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut config = Config::from_env();
    config.ledger_dir = args.ledger_dir;
    config.log_level = args.log_level;

    info!("Starting ledgerstream v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Capture(capture_args) => capture(config, capture_args).await,
        Command::Decode(decode_args) => decode(config, decode_args).await,
    }
}

async fn capture(mut config: Config, args: CaptureArgs) -> anyhow::Result<ExitCode> {
    config.locator_dir = args.locator_dir;
    if let Some(primary) = args.primary {
        config.ingest.primary_channel = primary;
    }
    if let Some(degree) = args.degree {
        config.ingest.degree = degree;
    }
    if let Some(min) = args.min_workers {
        config.ingest.min_workers = min;
    }
    if let Some(max) = args.max_workers {
        config.ingest.max_workers = max;
    }
    if let Some(ms) = args.drop_oldest_after_ms {
        config.ingest.drop_policy = DropPolicy::DropOldest {
            after: Duration::from_millis(ms),
        };
    }
    config.validate()?;

    if !args.stdin && args.channels.is_empty() && args.samples.is_empty() {
        bail!("nothing to capture: pass --stdin, --channel NAME=COMMAND or --samples NAME=PATH");
    }

    let local = Arc::new(
        LocalLedger::open(&config.ledger_dir, config.chain)
            .with_context(|| format!("opening ledger at {}", config.ledger_dir.display()))?,
    );
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(RetryingLedger::new(local.clone(), config.retry.clone()));

    let (index, sink) = match &args.resume {
        Some(path) => {
            let locator = Locator::load(path)?;
            let mut resolver = RecordResolver::new(Arc::clone(&ledger), config.resolver.clone());
            let index =
                ChainIndex::resume(Arc::clone(&ledger), config.ingest.degree, &locator, &mut resolver)
                    .await?;
            (index, LocatorSink::resume_at(path))
        }
        None => (
            ChainIndex::new(Arc::clone(&ledger), config.ingest.degree)?,
            LocatorSink::new(&config.locator_dir),
        ),
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (handle, task) = IngestPipeline::new(Arc::clone(&ledger), index, config.ingest.clone())
        .with_sink(sink)
        .start(shutdown_rx);
    let locators = handle.locator_watch();

    if args.stdin {
        let producer = ReaderProducer::new(config.ingest.primary_channel.clone(), tokio::io::stdin())
            .with_chunk_size(args.chunk_size);
        handle.spawn_producer(Box::new(producer));
    }
    for (name, command) in args.channels {
        match CommandProducer::spawn(name.clone(), command) {
            Ok(producer) => {
                handle.spawn_producer(Box::new(producer.with_chunk_size(args.chunk_size)));
            }
            Err(e) => {
                error!(channel = %name, error = %e, "Producer failed to start");
                handle.channel(&name).record_failure(e.to_string());
            }
        }
    }
    for (name, path) in args.samples {
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let producer = SampleProducer::json_lines(name, file, config.ingest.channel_capacity);
                handle.spawn_producer(Box::new(producer));
            }
            Err(e) => {
                error!(channel = %name, path = %path, error = %e, "Sample source failed to open");
                handle.channel(&name).record_failure(format!("{path}: {e}"));
            }
        }
    }
    drop(handle);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, finishing capture");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                // Dropping the sender would also stop the pipeline
                warn!(error = %e, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    });

    let outcome = task.await.context("ingest task panicked")?;

    if let Err(e) = local.flush().await {
        warn!(error = %e, "Failed to flush local ledger");
    }

    match outcome {
        Ok(summary) => {
            info!(
                batches = summary.batches,
                chunks = summary.chunks,
                bytes = summary.bytes,
                failed = summary.failed_uploads,
                dropped = summary.dropped,
                peak_workers = summary.peak_workers,
                "Capture finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let e = ArchiveError::from(e);
            let last = locators.borrow().clone();
            match last {
                Some(locator) => error!(
                    error = %e,
                    structural = e.is_structural(),
                    last_locator = %serde_json::to_string(&locator).unwrap_or_default(),
                    "Capture aborted"
                ),
                None => error!(error = %e, structural = e.is_structural(), "Capture aborted before any locator was written"),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn decode(mut config: Config, args: DecodeArgs) -> anyhow::Result<ExitCode> {
    if let Some(primary) = args.primary {
        config.ingest.primary_channel = primary;
    }
    if args.max_passes.is_some() {
        config.resolver.max_passes = args.max_passes;
    }

    let locator = Locator::load(&args.locator)?;
    let local = Arc::new(
        LocalLedger::open(&config.ledger_dir, config.chain)
            .with_context(|| format!("opening ledger at {}", config.ledger_dir.display()))?,
    );
    let ledger: Arc<dyn LedgerClient> = Arc::new(RetryingLedger::new(local, config.retry.clone()));
    let resolver = RecordResolver::new(ledger, config.resolver.clone());

    let mut decoder =
        match Decoder::from_locator(resolver, &locator, config.ingest.primary_channel.clone()).await {
            Ok(decoder) => decoder,
            Err(e) => return Ok(decode_failed(ArchiveError::from(e), 0)),
        };
    info!(
        head = %locator.head().map(|h| h.as_str()).unwrap_or_default(),
        leaves = locator.leaves,
        size = decoder.total_size(),
        "Decoding capture"
    );

    let mut stdout = tokio::io::stdout();
    let mut aux = AuxWriter::new(args.aux_dir);
    let mut gaps = 0u64;

    loop {
        let item = match decoder.next().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => return Ok(decode_failed(ArchiveError::from(e), decoder.offset())),
        };

        match item {
            DecodeItem::Chunk(chunk) if chunk.offset.is_some() => {
                stdout.write_all(&chunk.data).await?;
            }
            DecodeItem::Chunk(chunk) => aux.write(&chunk.channel, chunk.timestamp, &chunk.data).await?,
            DecodeItem::Gap(gap) => {
                gaps += 1;
                warn!(
                    channel = %gap.channel,
                    offset = gap.offset,
                    dropped_chunks = gap.dropped.as_ref().map(|d| d.count),
                    dropped_bytes = gap.dropped.as_ref().map(|d| d.bytes),
                    since = ?gap.dropped.as_ref().map(|d| d.since),
                    failure = gap.failure.as_deref(),
                    "Gap in channel"
                );
            }
        }
    }
    stdout.flush().await?;
    aux.finish().await?;

    let stats = decoder.resolver().stats();
    info!(
        bytes = decoder.offset(),
        gaps,
        cache_hits = stats.cache_hits,
        direct_hits = stats.direct_hits,
        scan_hits = stats.scan_hits,
        blocks_scanned = stats.blocks_scanned,
        "Decode complete"
    );
    Ok(ExitCode::SUCCESS)
}

fn decode_failed(e: ArchiveError, offset: u64) -> ExitCode {
    error!(error = %e, structural = e.is_structural(), offset, "Decode failed");
    ExitCode::FAILURE
}

/// Destination of auxiliary channel records
struct AuxWriter {
    dir: Option<PathBuf>,
    files: HashMap<String, tokio::fs::File>,
}

impl AuxWriter {
    fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            files: HashMap::new(),
        }
    }

    async fn write(
        &mut self,
        channel: &str,
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let Some(dir) = self.dir.as_deref() else {
            info!(
                channel,
                at = ?timestamp,
                bytes = data.len(),
                "Auxiliary record"
            );
            return Ok(());
        };

        if !self.files.contains_key(channel) {
            let file = open_aux(dir, channel).await?;
            self.files.insert(channel.to_string(), file);
        }
        if let Some(file) = self.files.get_mut(channel) {
            file.write_all(data).await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> anyhow::Result<()> {
        for file in self.files.values_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

async fn open_aux(dir: &Path, channel: &str) -> anyhow::Result<tokio::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    let safe: String = channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{safe}.bin"));
    tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel() {
        assert_eq!(
            parse_channel("logs=tail -f /var/log/syslog").unwrap(),
            ("logs".to_string(), "tail -f /var/log/syslog".to_string())
        );
        assert_eq!(
            parse_channel("q=a=b").unwrap(),
            ("q".to_string(), "a=b".to_string())
        );
        assert!(parse_channel("nocommand").is_err());
        assert!(parse_channel("=cmd").is_err());
    }

    #[test]
    fn test_cli_parses_capture_flags() {
        let args = Args::try_parse_from([
            "ledgerstream",
            "capture",
            "--stdin",
            "--channel",
            "gps=gpspipe -w",
            "--samples",
            "imu=/run/imu.jsonl",
            "--degree",
            "4",
            "--drop-oldest-after-ms",
            "200",
        ])
        .unwrap();

        match args.command {
            Command::Capture(capture) => {
                assert!(capture.stdin);
                assert_eq!(capture.channels.len(), 1);
                assert_eq!(
                    capture.samples,
                    vec![("imu".to_string(), "/run/imu.jsonl".to_string())]
                );
                assert_eq!(capture.degree, Some(4));
                assert_eq!(capture.drop_oldest_after_ms, Some(200));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
