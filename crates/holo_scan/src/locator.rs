//! Tablet-aware chunk planning.
//!
//! A table is split into tablets by row. Planner ranges are intersected with
//! every tablet they touch and grouped into one [`Chunk`] per tablet, carrying
//! the tablet's location as an affinity hint.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::{Authorizations, Chunk, ScanOptions};
use crate::error::ScanError;
use crate::key::{Key, KeyRange};
use crate::scheduler::ChunkBatches;

/// Contiguous row interval of a table served from one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    /// Inclusive start row; empty means unbounded.
    pub start_row: Vec<u8>,
    /// Exclusive end row; empty means unbounded.
    pub end_row: Vec<u8>,
    pub location: String,
}

impl Tablet {
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_row.as_slice()
            && (self.end_row.is_empty() || row < self.end_row.as_slice())
    }

    /// Part of `range` that falls into this tablet, if any.
    pub fn clip(&self, range: &KeyRange) -> Option<KeyRange> {
        let (start, start_inclusive) = if self.start_row.is_empty() {
            (range.start().cloned(), range.start_inclusive())
        } else {
            let tablet_start = Key::row_start(self.start_row.clone());
            match range.start() {
                Some(start) if *start >= tablet_start => {
                    (Some(start.clone()), range.start_inclusive())
                }
                _ => (Some(tablet_start), true),
            }
        };
        let (end, end_inclusive) = if self.end_row.is_empty() {
            (range.end().cloned(), range.end_inclusive())
        } else {
            let tablet_end = Key::row_start(self.end_row.clone());
            match range.end() {
                Some(end) if *end < tablet_end => (Some(end.clone()), range.end_inclusive()),
                _ => (Some(tablet_end), false),
            }
        };
        KeyRange::new(start, start_inclusive, end, end_inclusive).ok()
    }
}

/// Tablet layout of one table.
#[derive(Debug, Clone)]
pub struct TabletLocator {
    table: String,
    tablets: Arc<[Tablet]>,
}

impl TabletLocator {
    /// Builds a locator from tablets covering the whole row space without
    /// gaps or overlaps.
    pub fn new(table: impl Into<String>, mut tablets: Vec<Tablet>) -> Result<Self, ScanError> {
        let table = table.into();
        if tablets.is_empty() {
            return Err(ScanError::Config(format!("table `{table}` has no tablets")));
        }
        tablets.sort_by(|a, b| a.start_row.cmp(&b.start_row));
        let mut expected_start: &[u8] = &[];
        for (idx, tablet) in tablets.iter().enumerate() {
            if tablet.start_row != expected_start {
                return Err(ScanError::Config(format!(
                    "tablet {idx} of `{table}` starts at {} but the previous tablet ends at {}",
                    hex::encode(&tablet.start_row),
                    hex::encode(expected_start)
                )));
            }
            let last = idx + 1 == tablets.len();
            if tablet.end_row.is_empty() != last {
                return Err(ScanError::Config(format!(
                    "only the last tablet of `{table}` may be unbounded"
                )));
            }
            expected_start = &tablet.end_row;
        }
        Ok(Self {
            table,
            tablets: tablets.into(),
        })
    }

    /// Splits the table at `split_rows`, assigning locations round-robin.
    pub fn from_splits<R, L>(
        table: impl Into<String>,
        split_rows: impl IntoIterator<Item = R>,
        locations: &[L],
    ) -> Result<Self, ScanError>
    where
        R: Into<Vec<u8>>,
        L: AsRef<str>,
    {
        if locations.is_empty() {
            return Err(ScanError::Config("at least one location is required".to_string()));
        }
        let mut splits = split_rows.into_iter().map(Into::into).collect::<Vec<Vec<u8>>>();
        splits.sort();
        splits.dedup();
        splits.retain(|row| !row.is_empty());

        let mut tablets = Vec::with_capacity(splits.len() + 1);
        let mut start = Vec::new();
        for (idx, split) in splits.into_iter().chain(std::iter::once(Vec::new())).enumerate() {
            tablets.push(Tablet {
                start_row: std::mem::replace(&mut start, split.clone()),
                end_row: split,
                location: locations[idx % locations.len()].as_ref().to_string(),
            });
        }
        Self::new(table, tablets)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn tablets(&self) -> &[Tablet] {
        &self.tablets
    }

    pub fn locate_row(&self, row: &[u8]) -> Option<&Tablet> {
        let idx = self.tablets.partition_point(|tablet| {
            !tablet.end_row.is_empty() && tablet.end_row.as_slice() <= row
        });
        self.tablets.get(idx).filter(|tablet| tablet.contains_row(row))
    }

    /// Intersects every range with the tablets and groups the pieces into
    /// one chunk per tablet, in tablet order.
    pub fn bin_ranges(
        &self,
        auths: &Authorizations,
        ranges: &[KeyRange],
        options: &ScanOptions,
    ) -> Vec<Chunk> {
        let mut binned: BTreeMap<usize, Vec<KeyRange>> = BTreeMap::new();
        for range in ranges {
            for (idx, tablet) in self.tablets.iter().enumerate() {
                if let Some(piece) = tablet.clip(range) {
                    binned.entry(idx).or_default().push(piece);
                }
            }
        }
        binned
            .into_iter()
            .map(|(idx, mut pieces)| {
                pieces.sort();
                Chunk::new(self.table.clone(), auths.clone(), pieces)
                    .with_options(options.clone())
                    .with_location(self.tablets[idx].location.clone())
            })
            .collect()
    }

    /// Lazily bins `ranges` in groups of `batch_size`; each group becomes one
    /// batch of chunks.
    pub fn chunk_batches(
        &self,
        auths: Authorizations,
        ranges: Vec<KeyRange>,
        options: ScanOptions,
        batch_size: usize,
    ) -> ChunkBatches {
        let locator = self.clone();
        let batch_size = batch_size.max(1);
        let mut ranges = ranges.into_iter().peekable();
        Box::new(std::iter::from_fn(move || loop {
            ranges.peek()?;
            let group = ranges.by_ref().take(batch_size).collect::<Vec<_>>();
            let chunks = locator.bin_ranges(&auths, &group, &options);
            if !chunks.is_empty() {
                return Some(chunks);
            }
        }))
    }
}
