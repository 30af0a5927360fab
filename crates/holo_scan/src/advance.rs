//! Continuation ranges for partially consumed scans.

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::key::{Key, KeyRange, PartialKey};

/// Selects how the start of a continuation range is derived from the last
/// key a scan returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeAdvancer {
    /// Resume at the next possible key version.
    #[default]
    FullKey,
    /// Resume past the whole `(row, family, qualifier)` of the last key, so a
    /// resumed index scan never re-enters the shard (or collapsed day) it
    /// stopped in.
    ShardIndex,
}

impl RangeAdvancer {
    /// Returns a new range starting strictly after `last_key` with the end of
    /// `current`.
    ///
    /// Fails with `RangeExhausted` when that start would fall at or past the
    /// end boundary.
    pub fn advance(self, last_key: &Key, current: &KeyRange) -> Result<KeyRange, ScanError> {
        let start = self.continuation_start(last_key);
        if let Some(end) = current.end() {
            let exhausted = if current.end_inclusive() {
                start > *end
            } else {
                start >= *end
            };
            if exhausted {
                return Err(ScanError::RangeExhausted);
            }
        }
        KeyRange::new(
            Some(start),
            true,
            current.end().cloned(),
            current.end_inclusive(),
        )
    }

    fn continuation_start(self, last_key: &Key) -> Key {
        match self {
            Self::FullKey => last_key.following(PartialKey::RowFamilyQualifierVisibilityTime),
            Self::ShardIndex => {
                let mut qualifier = Vec::with_capacity(last_key.qualifier.len() + 1);
                qualifier.extend_from_slice(&last_key.qualifier);
                qualifier.push(0xFF);
                Key::new(
                    last_key.row.clone(),
                    last_key.family.clone(),
                    qualifier,
                    Vec::new(),
                    u64::MAX,
                )
            }
        }
    }
}
