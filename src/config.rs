//! Process configuration
//!
//! Every setting has a default and an `LEDGERSTREAM_*` environment
//! override; the binary layers command-line flags on top.

use std::path::PathBuf;
use std::str::FromStr;

use crate::decode::ResolverConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::ingest::IngestConfig;
use crate::ledger::{ChainShape, RetryConfig};

/// Parse `key` from the environment, falling back to `default` when unset or invalid
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Complete configuration of a capture or decode run
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of the local ledger journal
    pub ledger_dir: PathBuf,

    /// Directory locator files are written to
    pub locator_dir: PathBuf,

    pub log_level: String,

    /// Bundling model of a newly created local ledger
    pub chain: ChainShape,

    pub ingest: IngestConfig,
    pub retry: RetryConfig,
    pub resolver: ResolverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from("./ledger"),
            locator_dir: PathBuf::from("./locators"),
            log_level: "info".to_string(),
            chain: ChainShape::default(),
            ingest: IngestConfig::default(),
            retry: RetryConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ledger_dir: env_or("LEDGERSTREAM_LEDGER_DIR", d.ledger_dir),
            locator_dir: env_or("LEDGERSTREAM_LOCATOR_DIR", d.locator_dir),
            log_level: env_or("LEDGERSTREAM_LOG_LEVEL", d.log_level),
            chain: ChainShape {
                items_per_bundle: env_or(
                    "LEDGERSTREAM_ITEMS_PER_BUNDLE",
                    d.chain.items_per_bundle,
                ),
                bundles_per_block: env_or(
                    "LEDGERSTREAM_BUNDLES_PER_BLOCK",
                    d.chain.bundles_per_block,
                ),
            },
            ingest: IngestConfig::from_env(),
            retry: RetryConfig::from_env(),
            resolver: ResolverConfig::from_env(),
        }
    }

    /// Reject settings the index or the ledger cannot work with
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.ingest.degree < 2 {
            return Err(ArchiveError::Config(format!(
                "merge degree must be at least 2, got {}",
                self.ingest.degree
            )));
        }
        if self.ingest.primary_channel.is_empty() {
            return Err(ArchiveError::Config("primary channel name is empty".into()));
        }
        if self.chain.items_per_bundle == 0 || self.chain.bundles_per_block == 0 {
            return Err(ArchiveError::Config(
                "bundle and block sizes must be positive".into(),
            ));
        }
        Ok(())
    }
}
