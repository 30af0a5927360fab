//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use holo_scan::{
    Key, MemoryStore, ResultEntry, ScanConfig, ScanOrchestrator, ScanSession, StorageClient,
};

/// Upper bound for any single wait in these tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry with an empty visibility and a fixed timestamp.
pub fn cell(row: &str, family: &str, qualifier: &str, value: &str) -> ResultEntry {
    ResultEntry::new(Key::new(row, family, qualifier, "", 1), value)
}

/// `count` single-cell rows named `{prefix}{index:05}`.
pub fn numbered_rows(prefix: &str, count: usize) -> Vec<ResultEntry> {
    (0..count)
        .map(|idx| {
            let row = format!("{prefix}{idx:05}");
            cell(&row, "f", "q", &row)
        })
        .collect()
}

/// One cell per row for every `letter` x `per_letter` combination, rows
/// named `{letter}{index:03}`.
pub fn lettered_rows(
    letters: std::ops::RangeInclusive<char>,
    per_letter: usize,
) -> Vec<ResultEntry> {
    letters
        .flat_map(|letter| {
            (0..per_letter).map(move |idx| {
                let row = format!("{letter}{idx:03}");
                cell(&row, "f", "q", &row)
            })
        })
        .collect()
}

/// Timeouts shortened for tests; statistics enabled.
pub fn test_config() -> ScanConfig {
    ScanConfig {
        acquire_timeout: Duration::from_millis(100),
        offer_timeout: Duration::from_millis(20),
        park_interval: Duration::from_millis(2),
        scan_retry_delay: Duration::from_millis(1),
        close_wait: Duration::from_secs(2),
        accrue_stats: true,
        dedup_capacity: 10_000,
        ..ScanConfig::default()
    }
}

pub fn orchestrator(store: &MemoryStore, config: ScanConfig) -> Result<ScanOrchestrator> {
    let client: Arc<dyn StorageClient> = Arc::new(store.clone());
    Ok(ScanOrchestrator::new(client, config)?)
}

/// Pulls every remaining result of `session`.
pub async fn drain(session: &ScanSession) -> Result<Vec<ResultEntry>> {
    let mut out = Vec::new();
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while let Some(entry) = session.next_entry().await? {
        out.push(entry);
        if Instant::now() > deadline {
            bail!("session {} did not finish within {WAIT_TIMEOUT:?}", session.id());
        }
    }
    Ok(out)
}

/// Pulls at most `limit` results.
pub async fn take(session: &ScanSession, limit: usize) -> Result<Vec<ResultEntry>> {
    let mut out = Vec::with_capacity(limit);
    while out.len() < limit {
        match session.next_entry().await? {
            Some(entry) => out.push(entry),
            None => break,
        }
    }
    Ok(out)
}

pub fn rows(entries: &[ResultEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| String::from_utf8_lossy(&entry.key.row).into_owned())
        .collect()
}

/// Asserts that `entries` holds every key of `expected` exactly once.
pub fn assert_exactly_once(entries: &[ResultEntry], expected: &[ResultEntry]) {
    let mut seen = BTreeSet::new();
    for entry in entries {
        assert!(seen.insert(entry.key.clone()), "duplicate result {}", entry.key);
    }
    let wanted = expected
        .iter()
        .map(|entry| entry.key.clone())
        .collect::<BTreeSet<_>>();
    assert_eq!(seen.len(), wanted.len(), "result count mismatch");
    assert!(seen == wanted, "result keys differ from the table contents");
}

/// Polls `probe` until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn wait_until(what: &str, mut probe: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !probe() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
