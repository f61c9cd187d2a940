//! Ingest pipeline configuration

use std::time::Duration;

use crate::config::env_or;

/// What a full channel queue does with a new chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DropPolicy {
    /// Wait for space
    #[default]
    Block,

    /// Wait up to `after`, then discard the channel's oldest queued chunk
    DropOldest { after: Duration },
}

/// Ingest pipeline configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Merge degree of the chain index
    pub degree: u64,

    /// Channel whose bytes form the primary stream
    pub primary_channel: String,

    /// Queued chunks per channel before the drop policy applies
    pub channel_capacity: usize,

    /// Default policy for new channels
    pub drop_policy: DropPolicy,

    /// Workers kept alive while producers are active
    pub min_workers: usize,

    /// Upper bound on concurrent workers
    pub max_workers: usize,

    /// Grow the pool when queued chunks exceed `active * growth_factor`
    pub growth_factor: f64,

    /// Chunks a worker takes per round
    pub worker_batch: usize,

    /// Maximum chunks per leaf
    pub max_batch_items: usize,

    /// Maximum bytes per leaf
    pub max_batch_bytes: u64,

    /// Capacity of the worker result channel
    pub result_buffer: usize,

    /// Interval between minimum-block refreshes (seconds)
    pub block_refresh_secs: u64,

    /// Commit attempts per batch
    pub commit_retry_count: u32,

    /// Base delay for commit backoff (milliseconds)
    pub commit_retry_base_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            degree: 3,
            primary_channel: "capture".to_string(),
            channel_capacity: 1024,
            drop_policy: DropPolicy::Block,
            min_workers: 1,
            max_workers: 16,
            growth_factor: 2.25,
            worker_batch: 4,
            max_batch_items: 256,
            max_batch_bytes: 8 * 1024 * 1024,
            result_buffer: 1024,
            block_refresh_secs: 60,
            commit_retry_count: 5,
            commit_retry_base_ms: 100,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        let drop_policy = std::env::var("LEDGERSTREAM_DROP_OLDEST_AFTER_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|ms| DropPolicy::DropOldest {
                after: Duration::from_millis(ms),
            })
            .unwrap_or(d.drop_policy);

        Self {
            degree: env_or("LEDGERSTREAM_DEGREE", d.degree),
            primary_channel: std::env::var("LEDGERSTREAM_PRIMARY_CHANNEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(d.primary_channel),
            channel_capacity: env_or("LEDGERSTREAM_CHANNEL_CAPACITY", d.channel_capacity),
            drop_policy,
            min_workers: env_or("LEDGERSTREAM_MIN_WORKERS", d.min_workers),
            max_workers: env_or("LEDGERSTREAM_MAX_WORKERS", d.max_workers),
            growth_factor: env_or("LEDGERSTREAM_GROWTH_FACTOR", d.growth_factor),
            worker_batch: env_or("LEDGERSTREAM_WORKER_BATCH", d.worker_batch),
            max_batch_items: env_or("LEDGERSTREAM_MAX_BATCH_ITEMS", d.max_batch_items),
            max_batch_bytes: env_or("LEDGERSTREAM_MAX_BATCH_BYTES", d.max_batch_bytes),
            result_buffer: env_or("LEDGERSTREAM_RESULT_BUFFER", d.result_buffer),
            block_refresh_secs: env_or("LEDGERSTREAM_BLOCK_REFRESH_SECS", d.block_refresh_secs),
            commit_retry_count: env_or("LEDGERSTREAM_COMMIT_RETRY_COUNT", d.commit_retry_count),
            commit_retry_base_ms: env_or(
                "LEDGERSTREAM_COMMIT_RETRY_BASE_MS",
                d.commit_retry_base_ms,
            ),
        }
    }

    /// Clamp values that would stall the pipeline
    pub fn normalized(mut self) -> Self {
        self.min_workers = self.min_workers.max(1);
        self.max_workers = self.max_workers.max(self.min_workers);
        self.worker_batch = self.worker_batch.max(1);
        self.max_batch_items = self.max_batch_items.max(1);
        self.max_batch_bytes = self.max_batch_bytes.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self.result_buffer = self.result_buffer.max(1);
        self.block_refresh_secs = self.block_refresh_secs.max(1);
        self.commit_retry_count = self.commit_retry_count.max(1);
        if !self.growth_factor.is_finite() || self.growth_factor <= 0.0 {
            self.growth_factor = 2.25;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "LEDGERSTREAM_DEGREE",
        "LEDGERSTREAM_PRIMARY_CHANNEL",
        "LEDGERSTREAM_DROP_OLDEST_AFTER_MS",
        "LEDGERSTREAM_MAX_WORKERS",
        "LEDGERSTREAM_GROWTH_FACTOR",
        "LEDGERSTREAM_MAX_BATCH_BYTES",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = IngestConfig::default();
        assert_eq!(config.degree, 3);
        assert_eq!(config.primary_channel, "capture");
        assert_eq!(config.drop_policy, DropPolicy::Block);
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.growth_factor, 2.25);
        assert_eq!(config.max_batch_bytes, 8 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_from_env_uses_defaults_when_no_env_vars() {
        clear();
        let config = IngestConfig::from_env();
        assert_eq!(config.degree, 3);
        assert_eq!(config.drop_policy, DropPolicy::Block);
    }

    #[test]
    #[serial]
    fn test_from_env_drop_oldest() {
        clear();
        std::env::set_var("LEDGERSTREAM_DROP_OLDEST_AFTER_MS", "250");
        let config = IngestConfig::from_env();
        assert_eq!(
            config.drop_policy,
            DropPolicy::DropOldest {
                after: Duration::from_millis(250)
            }
        );
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_custom_values() {
        clear();
        std::env::set_var("LEDGERSTREAM_DEGREE", "5");
        std::env::set_var("LEDGERSTREAM_PRIMARY_CHANNEL", "video");
        std::env::set_var("LEDGERSTREAM_MAX_WORKERS", "3");
        std::env::set_var("LEDGERSTREAM_GROWTH_FACTOR", "1.5");

        let config = IngestConfig::from_env();
        assert_eq!(config.degree, 5);
        assert_eq!(config.primary_channel, "video");
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.growth_factor, 1.5);
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number_uses_default() {
        clear();
        std::env::set_var("LEDGERSTREAM_MAX_BATCH_BYTES", "lots");
        let config = IngestConfig::from_env();
        assert_eq!(config.max_batch_bytes, 8 * 1024 * 1024);
        clear();
    }

    #[test]
    fn test_normalized_clamps_degenerate_values() {
        let config = IngestConfig {
            min_workers: 0,
            max_workers: 0,
            worker_batch: 0,
            growth_factor: f64::NAN,
            ..IngestConfig::default()
        }
        .normalized();

        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.worker_batch, 1);
        assert_eq!(config.growth_factor, 2.25);
    }
}
