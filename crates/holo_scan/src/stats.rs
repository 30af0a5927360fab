//! In-process counters and timers for scan sessions.
//!
//! Counters are lock-free so producers and chunk tasks can update them on the
//! hot path; per-location aggregates sit behind a mutex because they are only
//! touched once per chunk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Per-location chunk aggregates used for hotspot visibility.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocationStats {
    /// Chunk executions submitted to this location.
    pub submitted: u64,
    /// Chunk executions that finished cleanly.
    pub completed: u64,
    /// Executions cut short by the scan time budget.
    pub time_sliced: u64,
    /// Dispatch attempts denied by backoff.
    pub deferred: u64,
}

/// Aggregated counters for one scan session.
#[derive(Debug, Default)]
pub struct ScanSessionStats {
    /// Time spent by the consumer inside `has_next`.
    has_next_ns: AtomicU64,
    /// Time spent acquiring and seeking resources before the first page.
    scanner_start_ns: AtomicU64,
    /// Time spent pulling pages from resources.
    scanner_iterate_ns: AtomicU64,
    /// Entries read from storage.
    keys_seen: AtomicU64,
    /// Entries handed to the consumer.
    results_delivered: AtomicU64,
    /// Pages fetched from storage.
    pages: AtomicU64,
    /// Scan passes started against a resource.
    passes: AtomicU64,
    /// Transient failures retried.
    retries: AtomicU64,
    /// Passes or chunks that yielded before finishing.
    time_slices: AtomicU64,
    /// Chunk dispatches deferred by backoff.
    deferrals: AtomicU64,
    /// Chunks resubmitted after a time slice or deferral.
    resubmissions: AtomicU64,
    /// Speculative races won by the batch strategy.
    speculative_batch_wins: AtomicU64,
    /// Speculative races won by the sequential strategy.
    speculative_sequential_wins: AtomicU64,
    /// Chunks fully scanned.
    chunks_completed: AtomicU64,
    /// Highest number of submitted, unfinished chunk tasks.
    peak_in_flight: AtomicU64,
    /// Entries dropped as probable duplicates.
    dedup_drops: AtomicU64,
    /// Index days collapsed into a single entry.
    compacted_days: AtomicU64,
    by_location: Mutex<BTreeMap<String, LocationStats>>,
}

/// Immutable snapshot of [`ScanSessionStats`].
///
/// Also used as the per-task accumulator merged into the session when a
/// chunk task completes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStatsSnapshot {
    pub has_next_ns: u64,
    pub scanner_start_ns: u64,
    pub scanner_iterate_ns: u64,
    pub keys_seen: u64,
    pub results_delivered: u64,
    pub pages: u64,
    pub passes: u64,
    pub retries: u64,
    pub time_slices: u64,
    pub deferrals: u64,
    pub resubmissions: u64,
    pub speculative_batch_wins: u64,
    pub speculative_sequential_wins: u64,
    pub chunks_completed: u64,
    pub peak_in_flight: u64,
    pub dedup_drops: u64,
    pub compacted_days: u64,
    pub by_location: BTreeMap<String, LocationStats>,
}

impl ScanStatsSnapshot {
    pub fn record_start(&mut self, elapsed: Duration) {
        self.scanner_start_ns += elapsed.as_nanos() as u64;
    }

    pub fn record_page(&mut self, entries: usize, elapsed: Duration) {
        self.pages += 1;
        self.keys_seen += entries as u64;
        self.scanner_iterate_ns += elapsed.as_nanos() as u64;
    }

    pub fn speculative_wins(&self) -> u64 {
        self.speculative_batch_wins + self.speculative_sequential_wins
    }
}

impl ScanSessionStats {
    pub fn record_has_next(&self, elapsed: Duration) {
        self.has_next_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_start(&self, elapsed: Duration) {
        self.scanner_start_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_page(&self, entries: usize, elapsed: Duration) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.keys_seen.fetch_add(entries as u64, Ordering::Relaxed);
        self.scanner_iterate_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_time_slice(&self) {
        self.time_slices.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_flight(&self, in_flight: usize) {
        self.peak_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    pub fn record_dedup_drop(&self) {
        self.dedup_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compacted_days(&self, days: u64) {
        self.compacted_days.fetch_add(days, Ordering::Relaxed);
    }

    /// Records a chunk execution submitted to `location`.
    pub fn record_submitted(&self, location: &str, resubmission: bool) {
        if resubmission {
            self.resubmissions.fetch_add(1, Ordering::Relaxed);
        }
        self.with_location(location, |stats| stats.submitted += 1);
    }

    /// Records a dispatch of a chunk for `location` deferred by backoff.
    pub fn record_deferred(&self, location: &str) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
        self.with_location(location, |stats| stats.deferred += 1);
    }

    /// Records a chunk execution at `location` that hit its time budget.
    pub fn record_chunk_time_slice(&self, location: &str) {
        self.time_slices.fetch_add(1, Ordering::Relaxed);
        self.with_location(location, |stats| stats.time_sliced += 1);
    }

    /// Merges the statistics of a completed chunk task.
    pub fn merge_completed(&self, location: &str, task: &ScanStatsSnapshot) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.merge(task);
        self.with_location(location, |stats| stats.completed += 1);
    }

    /// Adds the counters of a task accumulator.
    pub fn merge(&self, task: &ScanStatsSnapshot) {
        self.scanner_start_ns
            .fetch_add(task.scanner_start_ns, Ordering::Relaxed);
        self.scanner_iterate_ns
            .fetch_add(task.scanner_iterate_ns, Ordering::Relaxed);
        self.keys_seen.fetch_add(task.keys_seen, Ordering::Relaxed);
        self.pages.fetch_add(task.pages, Ordering::Relaxed);
        self.passes.fetch_add(task.passes, Ordering::Relaxed);
        self.retries.fetch_add(task.retries, Ordering::Relaxed);
        self.speculative_batch_wins
            .fetch_add(task.speculative_batch_wins, Ordering::Relaxed);
        self.speculative_sequential_wins
            .fetch_add(task.speculative_sequential_wins, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            has_next_ns: self.has_next_ns.load(Ordering::Relaxed),
            scanner_start_ns: self.scanner_start_ns.load(Ordering::Relaxed),
            scanner_iterate_ns: self.scanner_iterate_ns.load(Ordering::Relaxed),
            keys_seen: self.keys_seen.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            time_slices: self.time_slices.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            resubmissions: self.resubmissions.load(Ordering::Relaxed),
            speculative_batch_wins: self.speculative_batch_wins.load(Ordering::Relaxed),
            speculative_sequential_wins: self.speculative_sequential_wins.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            dedup_drops: self.dedup_drops.load(Ordering::Relaxed),
            compacted_days: self.compacted_days.load(Ordering::Relaxed),
            by_location: self
                .by_location
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    fn with_location(&self, location: &str, update: impl FnOnce(&mut LocationStats)) {
        let mut by_location = self
            .by_location
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(by_location.entry(location.to_string()).or_default());
    }
}
