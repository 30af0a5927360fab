//! Session progress tracking and resumable checkpoints.
//!
//! Every range a session will scan is registered as a slot; producers record
//! the last key they enqueued for each slot and mark slots done once the range
//! is exhausted. A checkpoint is the set of unfinished slots plus their last
//! enqueued key, which is enough to continue the same logical scan in a fresh
//! session without re-delivering anything already enqueued.

use serde::{Deserialize, Serialize};

use crate::advance::RangeAdvancer;
use crate::chunk::{Authorizations, Chunk, ScanOptions};
use crate::error::ScanError;
use crate::key::{Key, KeyRange};

/// Shape of the producer behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Sequential passes over planner ranges.
    Scanner,
    /// Sequential passes over index ranges with day compaction.
    RangeStream,
    /// Chunks dispatched onto the chunk scheduler.
    Batch,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanner => "scanner",
            Self::RangeStream => "range_stream",
            Self::Batch => "batch",
        }
    }
}

/// One range and the last key enqueued from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCheckpoint {
    pub range: KeyRange,
    #[serde(default)]
    pub last_key: Option<Key>,
    /// Set once the range was fully scanned.
    #[serde(default)]
    pub done: bool,
}

impl RangeCheckpoint {
    /// Range still to scan, or `None` when it was fully consumed.
    pub fn remaining(&self, advancer: RangeAdvancer) -> Result<Option<KeyRange>, ScanError> {
        if self.done {
            return Ok(None);
        }
        match &self.last_key {
            None => Ok(Some(self.range.clone())),
            Some(last) => match advancer.advance(last, &self.range) {
                Ok(range) => Ok(Some(range)),
                Err(ScanError::RangeExhausted) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }
}

/// One unfinished chunk and the progress of each of its ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub chunk: Chunk,
    pub ranges: Vec<RangeCheckpoint>,
}

/// Externalized session progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub kind: SessionKind,
    pub table: String,
    pub auths: Authorizations,
    #[serde(default)]
    pub options: ScanOptions,
    #[serde(default)]
    pub ranges: Vec<RangeCheckpoint>,
    #[serde(default)]
    pub chunks: Vec<ChunkCheckpoint>,
}

impl SessionCheckpoint {
    pub fn to_json(&self) -> Result<String, ScanError> {
        serde_json::to_string(self)
            .map_err(|err| ScanError::Checkpoint(format!("encode checkpoint: {err}")))
    }

    pub fn from_json(raw: &str) -> Result<Self, ScanError> {
        serde_json::from_str(raw)
            .map_err(|err| ScanError::Checkpoint(format!("decode checkpoint: {err}")))
    }

    /// Returns whether nothing remains to be scanned.
    pub fn is_complete(&self) -> bool {
        self.ranges.is_empty() && self.chunks.is_empty()
    }
}

#[derive(Debug, Clone)]
struct SlotProgress {
    range: KeyRange,
    last_key: Option<Key>,
    done: bool,
}

#[derive(Debug, Clone)]
struct ChunkSlots {
    chunk: Chunk,
    slots: Vec<usize>,
}

/// Snapshot of one slot handed to a producer.
#[derive(Debug, Clone)]
pub(crate) struct SlotView {
    pub range: KeyRange,
    pub last_key: Option<Key>,
    pub done: bool,
}

/// Per-range progress of one session.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    slots: Vec<SlotProgress>,
    chunks: Vec<ChunkSlots>,
}

impl Ledger {
    pub fn register_range(&mut self, range: KeyRange, last_key: Option<Key>) -> usize {
        self.slots.push(SlotProgress {
            range,
            last_key,
            done: false,
        });
        self.slots.len() - 1
    }

    /// Registers a chunk and one slot per range; `last_keys` seeds resumed
    /// progress by position.
    pub fn register_chunk(&mut self, chunk: Chunk, last_keys: &[Option<Key>]) -> Vec<usize> {
        let slots = chunk
            .ranges
            .iter()
            .enumerate()
            .map(|(idx, range)| {
                self.register_range(range.clone(), last_keys.get(idx).cloned().flatten())
            })
            .collect::<Vec<_>>();
        self.chunks.push(ChunkSlots {
            chunk,
            slots: slots.clone(),
        });
        slots
    }

    pub fn view(&self, slot: usize) -> Option<SlotView> {
        self.slots.get(slot).map(|progress| SlotView {
            range: progress.range.clone(),
            last_key: progress.last_key.clone(),
            done: progress.done,
        })
    }

    pub fn record_enqueued(&mut self, slot: usize, key: &Key) {
        if let Some(progress) = self.slots.get_mut(slot) {
            progress.last_key = Some(key.clone());
        }
    }

    pub fn mark_done(&mut self, slot: usize) {
        if let Some(progress) = self.slots.get_mut(slot) {
            progress.done = true;
        }
    }

    pub fn is_done(&self, slot: usize) -> bool {
        self.slots.get(slot).map_or(true, |progress| progress.done)
    }

    pub fn checkpoint(
        &self,
        kind: SessionKind,
        table: &str,
        auths: &Authorizations,
        options: &ScanOptions,
    ) -> SessionCheckpoint {
        let in_chunk = self
            .chunks
            .iter()
            .flat_map(|chunk| chunk.slots.iter().copied())
            .collect::<std::collections::HashSet<_>>();

        let ranges = self
            .slots
            .iter()
            .enumerate()
            .filter(|(slot, progress)| !progress.done && !in_chunk.contains(slot))
            .map(|(_, progress)| RangeCheckpoint {
                range: progress.range.clone(),
                last_key: progress.last_key.clone(),
                done: false,
            })
            .collect();

        let chunks = self
            .chunks
            .iter()
            .filter(|chunk| chunk.slots.iter().any(|slot| !self.is_done(*slot)))
            .map(|chunk| ChunkCheckpoint {
                chunk: chunk.chunk.clone(),
                ranges: chunk
                    .slots
                    .iter()
                    .filter_map(|slot| self.slots.get(*slot))
                    .map(|progress| RangeCheckpoint {
                        range: progress.range.clone(),
                        last_key: progress.last_key.clone(),
                        done: progress.done,
                    })
                    .collect(),
            })
            .collect();

        SessionCheckpoint {
            kind,
            table: table.to_string(),
            auths: auths.clone(),
            options: options.clone(),
            ranges,
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_keeps_unfinished_ranges_with_progress() {
        let mut ledger = Ledger::default();
        let first = ledger.register_range(KeyRange::row_span("a", "c").expect("range"), None);
        let second = ledger.register_range(KeyRange::row_span("c", "e").expect("range"), None);
        ledger.record_enqueued(first, &Key::new("a", "f", "q", "", 1));
        ledger.mark_done(first);
        ledger.record_enqueued(second, &Key::new("c", "f", "q", "", 1));

        let checkpoint = ledger.checkpoint(
            SessionKind::Scanner,
            "shard",
            &Authorizations::empty(),
            &ScanOptions::default(),
        );
        assert_eq!(checkpoint.ranges.len(), 1);
        let remaining = checkpoint.ranges[0]
            .remaining(RangeAdvancer::FullKey)
            .expect("advance")
            .expect("range left");
        assert!(remaining.start().expect("start") > &Key::new("c", "f", "q", "", 1));

        let decoded =
            SessionCheckpoint::from_json(&checkpoint.to_json().expect("encode")).expect("decode");
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn finished_chunk_ranges_resume_as_exhausted() {
        let mut ledger = Ledger::default();
        let chunk = Chunk::new(
            "shard",
            Authorizations::empty(),
            vec![
                KeyRange::row_span("a", "b").expect("range"),
                KeyRange::row_span("b", "c").expect("range"),
            ],
        );
        let slots = ledger.register_chunk(chunk, &[]);
        ledger.mark_done(slots[0]);

        let checkpoint = ledger.checkpoint(
            SessionKind::Batch,
            "shard",
            &Authorizations::empty(),
            &ScanOptions::default(),
        );
        assert!(checkpoint.ranges.is_empty());
        assert_eq!(checkpoint.chunks.len(), 1);
        let ranges = &checkpoint.chunks[0].ranges;
        assert!(ranges[0]
            .remaining(RangeAdvancer::FullKey)
            .expect("advance")
            .is_none());
        assert!(ranges[1]
            .remaining(RangeAdvancer::FullKey)
            .expect("advance")
            .is_some());
    }

    #[test]
    fn malformed_checkpoint_is_rejected() {
        assert!(matches!(
            SessionCheckpoint::from_json("{not json"),
            Err(ScanError::Checkpoint(_))
        ));
    }
}
