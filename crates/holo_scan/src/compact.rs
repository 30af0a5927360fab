//! Day-level compaction of shard index entries.
//!
//! Index entries carry a shard qualifier of the form `YYYYMMDD_N` and an
//! [`IndexInfo`] payload describing how many documents matched in that shard.
//! When a day has many shards and the median match count is high, listing
//! every shard costs more than it saves downstream, so the whole day is
//! replaced by one entry keyed by the day with an unbounded count.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::key::{Key, ResultEntry};

/// Length of the `YYYYMMDD` day label at the start of a shard qualifier.
pub const DAY_LABEL_LEN: usize = 8;

/// Default ceiling on the median per-shard count of a compactable day.
pub const DEFAULT_MAX_MEDIAN: u64 = 20;

/// Per-shard index payload: a match count and, when small enough, the
/// matching document ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Number of matches, or `-1` when the count is unknown.
    pub count: i64,
    pub uids: Vec<String>,
}

impl IndexInfo {
    pub fn with_count(count: i64) -> Self {
        Self {
            count,
            uids: Vec::new(),
        }
    }

    pub fn with_uids(uids: Vec<String>) -> Self {
        Self {
            count: uids.len() as i64,
            uids,
        }
    }

    /// Marker payload meaning "do not enumerate further".
    pub fn unbounded() -> Self {
        Self::with_count(-1)
    }

    pub fn is_unbounded(&self) -> bool {
        self.count < 0
    }

    /// Encodes as `count:i64be | n:u32be | (len:u32be | utf8)*n`.
    pub fn encode(&self) -> Vec<u8> {
        let uid_bytes = self.uids.iter().map(|uid| uid.len() + 4).sum::<usize>();
        let mut out = Vec::with_capacity(12 + uid_bytes);
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&(self.uids.len() as u32).to_be_bytes());
        for uid in &self.uids {
            out.extend_from_slice(&(uid.len() as u32).to_be_bytes());
            out.extend_from_slice(uid.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = bytes;
        let count = i64::from_be_bytes(take_array::<8>(&mut cursor).context("read count")?);
        let uid_count = u32::from_be_bytes(take_array::<4>(&mut cursor).context("read uid count")?);
        let mut uids = Vec::with_capacity(uid_count.min(1024) as usize);
        for idx in 0..uid_count {
            let len = u32::from_be_bytes(
                take_array::<4>(&mut cursor).with_context(|| format!("read uid {idx} length"))?,
            ) as usize;
            if cursor.len() < len {
                bail!("uid {idx} truncated: need {len} bytes, have {}", cursor.len());
            }
            let (raw, rest) = cursor.split_at(len);
            uids.push(String::from_utf8(raw.to_vec()).with_context(|| format!("uid {idx} utf8"))?);
            cursor = rest;
        }
        if !cursor.is_empty() {
            bail!("{} trailing bytes after index info", cursor.len());
        }
        Ok(Self { count, uids })
    }
}

fn take_array<const N: usize>(cursor: &mut &[u8]) -> anyhow::Result<[u8; N]> {
    if cursor.len() < N {
        bail!("need {N} bytes, have {}", cursor.len());
    }
    let (head, rest) = cursor.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    *cursor = rest;
    Ok(out)
}

/// Drops one trailing `_` from the qualifier of `key`.
pub fn trim_trailing_underscore(mut key: Key) -> Key {
    if key.qualifier.last() == Some(&b'_') {
        key.qualifier.pop();
    }
    key
}

/// Day label of an index key, if its qualifier carries one.
pub fn day_label(key: &Key) -> Option<&[u8]> {
    key.qualifier.get(..DAY_LABEL_LEN)
}

/// Online per-day compaction over one sorted index cursor.
///
/// Entries are pushed in key order; emitted entries are appended to the
/// caller's output buffer. A day's decision is final once emitted.
#[derive(Debug)]
pub struct DayCompactor {
    shards_per_day_threshold: usize,
    max_median: f64,
    day: Option<Vec<u8>>,
    pending: Vec<ResultEntry>,
    counts: Vec<i64>,
    compactable: bool,
    skip_day: Option<Vec<u8>>,
    compacted_days: u64,
}

impl DayCompactor {
    pub fn new(shards_per_day_threshold: usize, max_median: u64) -> Self {
        Self {
            shards_per_day_threshold,
            max_median: max_median as f64,
            day: None,
            pending: Vec::new(),
            counts: Vec::new(),
            compactable: true,
            skip_day: None,
            compacted_days: 0,
        }
    }

    /// Number of days collapsed so far.
    pub fn compacted_days(&self) -> u64 {
        self.compacted_days
    }

    /// Number of entries held for the current day.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, entry: ResultEntry, out: &mut Vec<ResultEntry>) {
        let entry = ResultEntry {
            key: trim_trailing_underscore(entry.key),
            ..entry
        };
        let Some(day) = day_label(&entry.key).map(<[u8]>::to_vec) else {
            // Not a shard entry: settle the buffered day and pass through.
            self.flush(out);
            out.push(entry);
            return;
        };

        if self.skip_day.as_deref() == Some(day.as_slice()) {
            trace!(key = %entry.key, "dropping shard of collapsed day");
            return;
        }
        self.skip_day = None;

        if self.day.as_deref() != Some(day.as_slice()) {
            self.flush(out);
            self.day = Some(day);
        }

        match IndexInfo::decode(&entry.value) {
            Ok(info) => insert_sorted(&mut self.counts, info.count),
            Err(err) => {
                trace!(
                    key = %entry.key,
                    error = %err,
                    "undecodable index payload; day stays exhaustive"
                );
                self.compactable = false;
            }
        }

        let within_threshold = self.pending.len() <= self.shards_per_day_threshold;
        if within_threshold || self.median_below_ceiling() {
            self.pending.push(entry);
            return;
        }

        trace!(
            day = %String::from_utf8_lossy(self.day.as_deref().unwrap_or_default()),
            shards = self.pending.len(),
            median = self.median(),
            "day exceeded shard threshold"
        );
        self.pending.push(entry);
        let collapsed_day = self.day.clone();
        let collapsed = self.settle(out);
        if collapsed {
            self.skip_day = collapsed_day;
        }
    }

    /// Settles the buffered day. Call at the end of every range.
    pub fn finish(&mut self, out: &mut Vec<ResultEntry>) {
        self.flush(out);
        self.skip_day = None;
    }

    fn flush(&mut self, out: &mut Vec<ResultEntry>) {
        let collapsed_day = self.day.clone();
        if self.settle(out) {
            self.skip_day = collapsed_day;
        }
    }

    /// Emits the buffered day either collapsed or entry by entry. Returns
    /// whether it was collapsed.
    fn settle(&mut self, out: &mut Vec<ResultEntry>) -> bool {
        let day = self.day.take();
        let pending = std::mem::take(&mut self.pending);
        let collapse = self.compactable
            && pending.len() >= self.shards_per_day_threshold
            && self.median() > self.max_median;
        self.counts.clear();
        self.compactable = true;

        let (Some(day), Some(first)) = (day, pending.first()) else {
            out.extend(pending);
            return false;
        };
        if !collapse {
            out.extend(pending);
            return false;
        }

        let key = Key::new(
            first.key.row.clone(),
            first.key.family.clone(),
            day,
            first.key.visibility.clone(),
            first.key.timestamp,
        );
        trace!(key = %key, shards = pending.len(), "collapsed day");
        out.push(ResultEntry::new(key, IndexInfo::unbounded().encode()));
        self.compacted_days += 1;
        true
    }

    fn median(&self) -> f64 {
        let len = self.counts.len();
        if len == 0 {
            return 0.0;
        }
        if len % 2 == 1 {
            self.counts[len / 2] as f64
        } else {
            (self.counts[len / 2 - 1] as f64 + self.counts[len / 2] as f64) / 2.0
        }
    }

    fn median_below_ceiling(&self) -> bool {
        !self.counts.is_empty() && self.median() < self.max_median
    }
}

fn insert_sorted(values: &mut Vec<i64>, value: i64) {
    let idx = values.partition_point(|existing| *existing <= value);
    values.insert(idx, value);
}
