//! Scan engine tunables.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::advance::RangeAdvancer;
use crate::compact::DEFAULT_MAX_MEDIAN;
use crate::error::ScanError;

const DEFAULT_THREAD_COUNT: usize = 5;
const DEFAULT_MAX_RESULTS: usize = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 250;
const DEFAULT_OFFER_TIMEOUT_MS: u64 = 200;
const DEFAULT_RANGE_MULTIPLIER: usize = 5;
const DEFAULT_QUEUE_MULTIPLIER: usize = 25;
const DEFAULT_PARK_INTERVAL_MS: u64 = 10;
const DEFAULT_DEDUP_CAPACITY: usize = 500_000;
const DEFAULT_DEDUP_FP_RATE: f64 = 1e-15;
const DEFAULT_SCAN_RETRY_LIMIT: usize = 5;
const DEFAULT_SCAN_RETRY_DELAY_MS: u64 = 60;
const DEFAULT_CLOSE_WAIT_MS: u64 = 5_000;
const DEFAULT_MODEL_CACHE_CAPACITY: usize = 256;
const DEFAULT_MODEL_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Budgets, timeouts and toggles shared by pools, sessions and schedulers.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Worker tasks per chunk scheduler.
    pub thread_count: usize,
    /// Resource pool size; defaults to `thread_count`.
    pub pool_capacity: Option<usize>,
    /// Result queue capacity per session.
    pub max_results: usize,
    /// Consumer poll interval.
    pub poll_interval: Duration,
    /// Single resource acquire attempt timeout.
    pub acquire_timeout: Duration,
    /// Single result queue offer attempt timeout.
    pub offer_timeout: Duration,
    /// Per-chunk scan time budget; `None` scans each chunk to completion.
    pub scan_limit: Option<Duration>,
    pub range_multiplier: usize,
    pub queue_multiplier: usize,
    /// Scheduler sleep when both admission ceilings are hit.
    pub park_interval: Duration,
    pub speculative_scanning: bool,
    pub backoff_enabled: bool,
    /// Yield a sequential pass's resource after a slice of results.
    pub fairness: bool,
    pub accrue_stats: bool,
    pub dedup_capacity: usize,
    pub dedup_fp_rate: f64,
    pub shards_per_day_threshold: usize,
    pub max_median: u64,
    pub scan_retry_limit: usize,
    pub scan_retry_delay: Duration,
    /// How long `close` waits for a producer before aborting it.
    pub close_wait: Duration,
    pub model_cache_capacity: usize,
    pub model_cache_ttl: Duration,
    pub advancer: RangeAdvancer,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            pool_capacity: None,
            max_results: DEFAULT_MAX_RESULTS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            offer_timeout: Duration::from_millis(DEFAULT_OFFER_TIMEOUT_MS),
            scan_limit: None,
            range_multiplier: DEFAULT_RANGE_MULTIPLIER,
            queue_multiplier: DEFAULT_QUEUE_MULTIPLIER,
            park_interval: Duration::from_millis(DEFAULT_PARK_INTERVAL_MS),
            speculative_scanning: false,
            backoff_enabled: false,
            fairness: true,
            accrue_stats: false,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_fp_rate: DEFAULT_DEDUP_FP_RATE,
            shards_per_day_threshold: usize::MAX,
            max_median: DEFAULT_MAX_MEDIAN,
            scan_retry_limit: DEFAULT_SCAN_RETRY_LIMIT,
            scan_retry_delay: Duration::from_millis(DEFAULT_SCAN_RETRY_DELAY_MS),
            close_wait: Duration::from_millis(DEFAULT_CLOSE_WAIT_MS),
            model_cache_capacity: DEFAULT_MODEL_CACHE_CAPACITY,
            model_cache_ttl: Duration::from_millis(DEFAULT_MODEL_CACHE_TTL_MS),
            advancer: RangeAdvancer::FullKey,
        }
    }
}

impl ScanConfig {
    /// Loads configuration from `HOLO_SCAN_*` environment variables, falling
    /// back to defaults for unset values.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let thread_count = parse_usize(env("THREAD_COUNT"), defaults.thread_count)?;
        let pool_capacity = env("POOL_CAPACITY")
            .map(|raw| {
                raw.parse::<usize>()
                    .with_context(|| format!("invalid usize value: {raw}"))
            })
            .transpose()?;
        let scan_limit = match env("SCAN_LIMIT_MS") {
            Some(raw) => Some(Duration::from_millis(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid u64 value: {raw}"))?,
            )),
            None => None,
        };
        let advancer = match env("ADVANCER").as_deref() {
            None | Some("full_key") => RangeAdvancer::FullKey,
            Some("shard_index") => RangeAdvancer::ShardIndex,
            Some(other) => anyhow::bail!("invalid advancer: {other}"),
        };

        let config = Self {
            thread_count,
            pool_capacity,
            max_results: parse_usize(env("MAX_RESULTS"), defaults.max_results)?,
            poll_interval: parse_millis(env("POLL_INTERVAL_MS"), defaults.poll_interval)?,
            acquire_timeout: parse_millis(env("ACQUIRE_TIMEOUT_MS"), defaults.acquire_timeout)?,
            offer_timeout: parse_millis(env("OFFER_TIMEOUT_MS"), defaults.offer_timeout)?,
            scan_limit,
            range_multiplier: parse_usize(env("RANGE_MULTIPLIER"), defaults.range_multiplier)?,
            queue_multiplier: parse_usize(env("QUEUE_MULTIPLIER"), defaults.queue_multiplier)?,
            park_interval: parse_millis(env("PARK_INTERVAL_MS"), defaults.park_interval)?,
            speculative_scanning: parse_bool(env("SPECULATIVE"), defaults.speculative_scanning)?,
            backoff_enabled: parse_bool(env("BACKOFF"), defaults.backoff_enabled)?,
            fairness: parse_bool(env("FAIRNESS"), defaults.fairness)?,
            accrue_stats: parse_bool(env("ACCRUE_STATS"), defaults.accrue_stats)?,
            dedup_capacity: parse_usize(env("DEDUP_CAPACITY"), defaults.dedup_capacity)?,
            dedup_fp_rate: parse_f64(env("DEDUP_FP_RATE"), defaults.dedup_fp_rate)?,
            shards_per_day_threshold: parse_usize(
                env("SHARDS_PER_DAY_THRESHOLD"),
                defaults.shards_per_day_threshold,
            )?,
            max_median: parse_u64(env("MAX_MEDIAN"), defaults.max_median)?,
            scan_retry_limit: parse_usize(env("SCAN_RETRY_LIMIT"), defaults.scan_retry_limit)?,
            scan_retry_delay: parse_millis(env("SCAN_RETRY_DELAY_MS"), defaults.scan_retry_delay)?,
            close_wait: parse_millis(env("CLOSE_WAIT_MS"), defaults.close_wait)?,
            model_cache_capacity: parse_usize(
                env("MODEL_CACHE_CAPACITY"),
                defaults.model_cache_capacity,
            )?,
            model_cache_ttl: parse_millis(env("MODEL_CACHE_TTL_MS"), defaults.model_cache_ttl)?,
            advancer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero-sized budgets and out-of-range rates.
    pub fn validate(&self) -> Result<(), ScanError> {
        let nonzero = [
            ("thread_count", self.thread_count),
            ("pool_capacity", self.pool_capacity()),
            ("max_results", self.max_results),
            ("range_multiplier", self.range_multiplier),
            ("queue_multiplier", self.queue_multiplier),
            ("dedup_capacity", self.dedup_capacity),
            ("shards_per_day_threshold", self.shards_per_day_threshold),
            ("model_cache_capacity", self.model_cache_capacity),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ScanError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.poll_interval.is_zero()
            || self.acquire_timeout.is_zero()
            || self.offer_timeout.is_zero()
        {
            return Err(ScanError::Config(
                "poll, acquire and offer timeouts must be non-zero".to_string(),
            ));
        }
        if self.scan_limit.is_some_and(|limit| limit.is_zero()) {
            return Err(ScanError::Config("scan_limit must be non-zero".to_string()));
        }
        if !(self.dedup_fp_rate > 0.0 && self.dedup_fp_rate < 1.0) {
            return Err(ScanError::Config(format!(
                "dedup_fp_rate must be in (0, 1), got {}",
                self.dedup_fp_rate
            )));
        }
        Ok(())
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity.unwrap_or(self.thread_count)
    }

    /// Entries a sequential pass emits before yielding its resource.
    pub fn fairness_slice(&self) -> usize {
        (self.max_results as f64 * 1.5).ceil() as usize
    }

    /// Submitted-task ceiling before chunks are buffered.
    pub fn max_in_flight(&self) -> usize {
        self.thread_count.saturating_mul(self.range_multiplier)
    }

    /// Buffered-chunk ceiling before the scheduler parks.
    pub fn max_pending(&self) -> usize {
        self.thread_count.saturating_mul(self.queue_multiplier)
    }

    /// Delay before transient-failure retry `attempt` (zero-based).
    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        let exp = 1u32 << attempt.min(5);
        self.scan_retry_delay.saturating_mul(exp)
    }
}

fn env(suffix: &str) -> Option<String> {
    std::env::var(format!("HOLO_SCAN_{suffix}")).ok()
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_f64(value: Option<String>, default_value: f64) -> Result<f64> {
    match value {
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("invalid f64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => raw
            .parse::<bool>()
            .with_context(|| format!("invalid bool value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_millis(value: Option<String>, default_value: Duration) -> Result<Duration> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("invalid millisecond value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ScanConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.pool_capacity(), 5);
        assert_eq!(config.fairness_slice(), 1500);
        assert_eq!(config.max_in_flight(), 25);
        assert_eq!(config.max_pending(), 125);
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let config = ScanConfig {
            max_results: 0,
            ..ScanConfig::default()
        };
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
        let config = ScanConfig {
            dedup_fp_rate: 1.5,
            ..ScanConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_backoff_is_capped() {
        let config = ScanConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_millis(60));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(240));
        assert_eq!(config.retry_backoff(9), Duration::from_millis(60 * 32));
    }

    #[test]
    fn parse_helpers_reject_garbage() {
        assert!(parse_usize(Some("x".into()), 1).is_err());
        assert_eq!(parse_usize(None, 7).expect("default"), 7);
        assert!(parse_bool(Some("maybe".into()), false).is_err());
        assert_eq!(
            parse_millis(Some("15".into()), Duration::ZERO).expect("millis"),
            Duration::from_millis(15)
        );
    }
}
