//! Key, range and result-entry primitives.
//!
//! Keys are ordered lexicographically over `(row, family, qualifier,
//! visibility)` with the timestamp compared descending as the final
//! tie-break, so the newest version of a cell sorts first.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Immutable, totally ordered store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Partition (row) component.
    pub row: Vec<u8>,
    /// Column family.
    pub family: Vec<u8>,
    /// Column qualifier.
    pub qualifier: Vec<u8>,
    /// Visibility label.
    pub visibility: Vec<u8>,
    /// Version timestamp; larger values sort first.
    pub timestamp: u64,
}

/// Key prefix granularity used when computing a following key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialKey {
    Row,
    RowFamily,
    RowFamilyQualifier,
    RowFamilyQualifierVisibility,
    RowFamilyQualifierVisibilityTime,
}

impl Key {
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        visibility: impl Into<Vec<u8>>,
        timestamp: u64,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: visibility.into(),
            timestamp,
        }
    }

    /// Smallest key within `row`.
    pub fn row_start(row: impl Into<Vec<u8>>) -> Self {
        Self::new(row, Vec::new(), Vec::new(), Vec::new(), u64::MAX)
    }

    /// Returns the smallest key strictly greater than every key sharing this
    /// key's prefix at `part` granularity.
    ///
    /// At full granularity this is the next older version of the same cell.
    pub fn following(&self, part: PartialKey) -> Key {
        match part {
            PartialKey::Row => Key::row_start(with_zero(&self.row)),
            PartialKey::RowFamily => Key::new(
                self.row.clone(),
                with_zero(&self.family),
                Vec::new(),
                Vec::new(),
                u64::MAX,
            ),
            PartialKey::RowFamilyQualifier => Key::new(
                self.row.clone(),
                self.family.clone(),
                with_zero(&self.qualifier),
                Vec::new(),
                u64::MAX,
            ),
            PartialKey::RowFamilyQualifierVisibility => Key::new(
                self.row.clone(),
                self.family.clone(),
                self.qualifier.clone(),
                with_zero(&self.visibility),
                u64::MAX,
            ),
            PartialKey::RowFamilyQualifierVisibilityTime => {
                if self.timestamp == 0 {
                    self.following(PartialKey::RowFamilyQualifierVisibility)
                } else {
                    let mut next = self.clone();
                    next.timestamp -= 1;
                    next
                }
            }
        }
    }
}

fn with_zero(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(0);
    out
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} [{}] {}",
            String::from_utf8_lossy(&self.row),
            String::from_utf8_lossy(&self.family).replace('\0', "\\x00"),
            String::from_utf8_lossy(&self.qualifier),
            String::from_utf8_lossy(&self.visibility),
            self.timestamp
        )
    }
}

/// Contiguous interval over the key space. `None` bounds are open.
///
/// Ranges are never mutated; continuation produces a new range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Option<Key>,
    start_inclusive: bool,
    end: Option<Key>,
    end_inclusive: bool,
}

impl KeyRange {
    /// Builds a range, rejecting a start that lies after the end.
    pub fn new(
        start: Option<Key>,
        start_inclusive: bool,
        end: Option<Key>,
        end_inclusive: bool,
    ) -> Result<Self, ScanError> {
        if let (Some(start_key), Some(end_key)) = (start.as_ref(), end.as_ref()) {
            let invalid = match start_key.cmp(end_key) {
                Ordering::Greater => true,
                Ordering::Equal => !(start_inclusive && end_inclusive),
                Ordering::Less => false,
            };
            if invalid {
                return Err(ScanError::InvalidRange(format!(
                    "start `{start_key}` is not before end `{end_key}`"
                )));
            }
        }
        Ok(Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        })
    }

    /// Range covering the whole key space.
    pub fn all() -> Self {
        Self {
            start: None,
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        }
    }

    /// Rows in `[start_row, end_row)`.
    pub fn row_span(
        start_row: impl Into<Vec<u8>>,
        end_row: impl Into<Vec<u8>>,
    ) -> Result<Self, ScanError> {
        Self::new(
            Some(Key::row_start(start_row)),
            true,
            Some(Key::row_start(end_row)),
            false,
        )
    }

    /// Every key of a single row.
    pub fn exact_row(row: impl Into<Vec<u8>>) -> Self {
        let start = Key::row_start(row);
        let end = start.following(PartialKey::Row);
        Self {
            start: Some(start),
            start_inclusive: true,
            end: Some(end),
            end_inclusive: false,
        }
    }

    pub fn start(&self) -> Option<&Key> {
        self.start.as_ref()
    }

    pub fn start_inclusive(&self) -> bool {
        self.start_inclusive
    }

    pub fn end(&self) -> Option<&Key> {
        self.end.as_ref()
    }

    pub fn end_inclusive(&self) -> bool {
        self.end_inclusive
    }

    /// Returns whether `key` sorts before the start boundary.
    pub fn before_start(&self, key: &Key) -> bool {
        match &self.start {
            None => false,
            Some(start) if self.start_inclusive => key < start,
            Some(start) => key <= start,
        }
    }

    /// Returns whether `key` sorts past the end boundary.
    pub fn after_end(&self, key: &Key) -> bool {
        match &self.end {
            None => false,
            Some(end) if self.end_inclusive => key > end,
            Some(end) => key >= end,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }

    /// Returns whether a range whose last returned key is `last` has nothing
    /// left to produce.
    pub fn is_exhausted_by(&self, last: &Key) -> bool {
        match &self.end {
            None => false,
            Some(end) => last >= end,
        }
    }

    /// Returns a copy of this range with a new start boundary.
    pub fn with_start(&self, start: Key, inclusive: bool) -> Result<Self, ScanError> {
        Self::new(Some(start), inclusive, self.end.clone(), self.end_inclusive)
    }
}

impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        let start = match (&self.start, &other.start) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => left.cmp(right),
        };
        start
            .then_with(|| other.start_inclusive.cmp(&self.start_inclusive))
            .then_with(|| match (&self.end, &other.end) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(left), Some(right)) => left.cmp(right),
            })
            .then_with(|| self.end_inclusive.cmp(&other.end_inclusive))
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.start_inclusive { '[' } else { '(' };
        let close = if self.end_inclusive { ']' } else { ')' };
        match &self.start {
            Some(start) => write!(f, "{open}{start}")?,
            None => write!(f, "{open}-inf")?,
        }
        match &self.end {
            Some(end) => write!(f, ", {end}{close}"),
            None => write!(f, ", +inf{close}"),
        }
    }
}

/// One key/value pair produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub key: Key,
    pub value: Vec<u8>,
    /// Marks a final entry for its stream; never filtered by dedup.
    #[serde(default)]
    pub terminal: bool,
}

impl ResultEntry {
    pub fn new(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
            terminal: false,
        }
    }

    pub fn terminal(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
            terminal: true,
        }
    }

    /// Approximate payload size in bytes.
    pub fn size(&self) -> usize {
        self.key.row.len()
            + self.key.family.len()
            + self.key.qualifier.len()
            + self.key.visibility.len()
            + 8
            + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_breaks_ties_descending() {
        let newer = Key::new("r", "f", "q", "", 20);
        let older = Key::new("r", "f", "q", "", 10);
        assert!(newer < older);
        assert!(Key::row_start("r") < newer);
        assert!(older < Key::new("r", "f", "q\0", "", u64::MAX));
    }

    #[test]
    fn following_key_is_strictly_greater() {
        let key = Key::new("row", "fam", "qual", "vis", 7);
        for part in [
            PartialKey::Row,
            PartialKey::RowFamily,
            PartialKey::RowFamilyQualifier,
            PartialKey::RowFamilyQualifierVisibility,
            PartialKey::RowFamilyQualifierVisibilityTime,
        ] {
            assert!(key.following(part) > key, "part={part:?}");
        }
        let oldest = Key::new("row", "fam", "qual", "vis", 0);
        assert!(oldest.following(PartialKey::RowFamilyQualifierVisibilityTime) > oldest);
    }

    #[test]
    fn range_rejects_start_after_end() {
        assert!(matches!(
            KeyRange::row_span("c", "a"),
            Err(ScanError::InvalidRange(_))
        ));
        assert!(KeyRange::row_span("a", "a").is_err());
        let point = Key::row_start("a");
        assert!(KeyRange::new(Some(point.clone()), true, Some(point), true).is_ok());
    }

    #[test]
    fn range_boundaries_respect_inclusivity() {
        let range = KeyRange::row_span("a", "c").expect("range");
        assert!(range.contains(&Key::new("a", "", "", "", 1)));
        assert!(range.contains(&Key::new("b", "x", "y", "", 1)));
        assert!(range.after_end(&Key::row_start("c")));
        assert!(range.before_start(&Key::row_start("0")));

        let inclusive = KeyRange::new(
            Some(Key::row_start("a")),
            false,
            Some(Key::row_start("c")),
            true,
        )
        .expect("range");
        assert!(!inclusive.contains(&Key::row_start("a")));
        assert!(inclusive.contains(&Key::row_start("c")));
        assert!(inclusive.is_exhausted_by(&Key::row_start("c")));
        assert!(!inclusive.is_exhausted_by(&Key::row_start("b")));
    }

    #[test]
    fn ranges_order_by_start_key() {
        let mut ranges = vec![
            KeyRange::row_span("m", "p").expect("range"),
            KeyRange::all(),
            KeyRange::row_span("c", "e").expect("range"),
        ];
        ranges.sort();
        assert_eq!(ranges[0], KeyRange::all());
        assert_eq!(ranges[1].start(), Some(&Key::row_start("c")));
    }
}
