//! Best-effort duplicate suppression over result streams.
//!
//! Identity is derived from the last two `\0`-separated tokens of the column
//! family (data type and uid) joined with the row. A bloom filter remembers
//! identities that were handed downstream; false positives may drop a unique
//! entry at the configured rate, duplicates are never let through.

use std::sync::Mutex;

use bloomfilter::Bloom;
use futures_util::{future, Stream, StreamExt};
use tracing::trace;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::key::ResultEntry;
use crate::session::ScanSession;

/// Identity used for duplicate detection, or `None` for entries that always
/// pass (range-completion markers and terminal entries).
pub fn dedup_key(entry: &ResultEntry) -> Option<Vec<u8>> {
    if entry.terminal || entry.key.family.is_empty() {
        return None;
    }
    let tokens = entry.key.family.split(|byte| *byte == 0).collect::<Vec<_>>();
    let identity = &tokens[tokens.len().saturating_sub(2)..];
    let mut key = identity.join(&0u8);
    key.push(0);
    key.extend_from_slice(&entry.key.row);
    Some(key)
}

pub struct Deduplicator {
    filter: Bloom<[u8]>,
    dropped: u64,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl Deduplicator {
    /// Sizes the filter for `capacity` identities at false-positive rate
    /// `fp_rate`.
    pub fn new(capacity: usize, fp_rate: f64) -> Result<Self, ScanError> {
        if capacity == 0 || !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(ScanError::Config(format!(
                "dedup filter needs a positive capacity and a rate in (0, 1), got {capacity} / {fp_rate}"
            )));
        }
        Ok(Self {
            filter: Bloom::new_for_fp_rate(capacity, fp_rate),
            dropped: 0,
        })
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, ScanError> {
        Self::new(config.dedup_capacity, config.dedup_fp_rate)
    }

    /// Returns whether `entry` was (probably) emitted before.
    pub fn is_duplicate(&self, entry: &ResultEntry) -> bool {
        dedup_key(entry).is_some_and(|key| self.filter.check(&key))
    }

    /// Remembers the identity of an entry handed downstream.
    pub fn mark_emitted(&mut self, entry: &ResultEntry) {
        if let Some(key) = dedup_key(entry) {
            self.filter.set(&key);
        }
    }

    /// Entries dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Passes `entry` through unless it is a duplicate.
    pub fn admit(&mut self, entry: ResultEntry) -> Option<ResultEntry> {
        if self.is_duplicate(&entry) {
            self.dropped += 1;
            trace!(row = %hex::encode(&entry.key.row), "dropping duplicate entry");
            return None;
        }
        self.mark_emitted(&entry);
        Some(entry)
    }

    /// Filters a result stream. Errors pass through untouched.
    pub fn apply<S>(mut self, stream: S) -> impl Stream<Item = Result<ResultEntry, ScanError>>
    where
        S: Stream<Item = Result<ResultEntry, ScanError>>,
    {
        stream.filter_map(move |item| {
            future::ready(match item {
                Ok(entry) => self.admit(entry).map(Ok),
                Err(err) => Some(Err(err)),
            })
        })
    }
}

/// Session wrapper that drops duplicate results on the pull path.
///
/// An identity is recorded when `next` hands the entry out, not when
/// `has_next` looks at it.
#[derive(Debug)]
pub struct DedupSession {
    session: ScanSession,
    filter: Mutex<Deduplicator>,
    buffered: Mutex<Option<ResultEntry>>,
}

impl DedupSession {
    pub fn new(session: ScanSession, filter: Deduplicator) -> Self {
        Self {
            session,
            filter: Mutex::new(filter),
            buffered: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    pub async fn has_next(&self) -> Result<bool, ScanError> {
        if self.lock_buffered().is_some() {
            return Ok(true);
        }
        while let Some(entry) = self.session.next_entry().await? {
            let duplicate = self.lock_filter().is_duplicate(&entry);
            if duplicate {
                self.lock_filter().dropped += 1;
                self.session.shared().stats.record_dedup_drop();
                continue;
            }
            *self.lock_buffered() = Some(entry);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn next(&self) -> Result<ResultEntry, ScanError> {
        let entry = self.lock_buffered().take().ok_or(ScanError::NoBufferedResult)?;
        self.lock_filter().mark_emitted(&entry);
        Ok(entry)
    }

    pub async fn next_entry(&self) -> Result<Option<ResultEntry>, ScanError> {
        if self.has_next().await? {
            self.next().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn dropped(&self) -> u64 {
        self.lock_filter().dropped()
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    fn lock_filter(&self) -> std::sync::MutexGuard<'_, Deduplicator> {
        self.filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_buffered(&self) -> std::sync::MutexGuard<'_, Option<ResultEntry>> {
        self.buffered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn entry(row: &str, family: &[u8], value: &str) -> ResultEntry {
        ResultEntry::new(Key::new(row, family.to_vec(), "", "", 1), value)
    }

    #[test]
    fn identity_uses_trailing_family_tokens_and_row() {
        let key = dedup_key(&entry("20240101_3", b"shard\0A\x001", "v")).expect("identity");
        assert_eq!(key, b"A\x001\x0020240101_3".to_vec());
        assert!(dedup_key(&entry("r", b"", "v")).is_none());
    }

    #[test]
    fn duplicates_with_different_values_are_dropped() {
        let mut dedup = Deduplicator::new(1_000, 1e-9).expect("filter");
        let first = entry("r", b"A\x001", "one");
        let second = entry("r", b"A\x001", "two");
        let other = entry("r", b"A\x002", "one");
        assert!(dedup.admit(first).is_some());
        assert!(dedup.admit(second).is_none());
        assert!(dedup.admit(other).is_some());
        assert_eq!(dedup.dropped(), 1);
    }

    #[test]
    fn terminal_entries_always_pass() {
        let mut dedup = Deduplicator::new(1_000, 1e-9).expect("filter");
        let key = Key::new("r", "A\x001", "", "", 1);
        for _ in 0..3 {
            assert!(dedup
                .admit(ResultEntry::terminal(key.clone(), "final"))
                .is_some());
        }
        assert_eq!(dedup.dropped(), 0);
    }

    #[test]
    fn identity_is_recorded_only_on_emission() {
        let mut dedup = Deduplicator::new(1_000, 1e-9).expect("filter");
        let probe = entry("r", b"A\x001", "v");
        assert!(!dedup.is_duplicate(&probe));
        assert!(!dedup.is_duplicate(&probe));
        dedup.mark_emitted(&probe);
        assert!(dedup.is_duplicate(&probe));
    }

    #[tokio::test]
    async fn stream_filter_keeps_order_and_errors() {
        let dedup = Deduplicator::new(1_000, 1e-9).expect("filter");
        let items = vec![
            Ok(entry("a", b"A\x001", "1")),
            Ok(entry("b", b"A\x001", "2")),
            Ok(entry("a", b"A\x001", "3")),
            Err(ScanError::NoBufferedResult),
        ];
        let out = dedup
            .apply(futures_util::stream::iter(items))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().expect("entry").value, b"1".to_vec());
        assert_eq!(out[1].as_ref().expect("entry").value, b"2".to_vec());
        assert!(out[2].is_err());
    }
}
