//! Log merge engine
//!
//! Combines a point-in-time snapshot of a job's logs with entries arriving
//! from a live stream into one ascending, duplicate-free view.
//!
//! The resume cursor is the contiguous high-water mark: every sequence
//! number from the seed point up to the cursor has been accepted. Entries
//! above the cursor may arrive out of order and are slotted into place; a
//! replacement stream resumes from the cursor, so holes are re-requested and
//! anything already held comes back as a duplicate.

use std::ops::RangeInclusive;

use tracing::warn;
use vigil_core::domain::log::LogEntry;
use vigil_core::dto::log::LogPage;

/// What the merge engine did with an incoming entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// New sequence number, now part of the view
    Accept,
    /// Sequence number already held, dropped
    Duplicate,
    /// Never seen yet below the resume cursor; a producer-side anomaly, dropped
    OutOfOrder,
}

/// Ordered log buffer of one job
///
/// Sequence numbers start at 1; a cursor of 0 means nothing consumed yet.
#[derive(Debug, Clone, Default)]
pub struct LogMerger {
    /// Sorted ascending by sequence number, no duplicates
    entries: Vec<LogEntry>,
    cursor: u64,
    anomalies: u64,
}

impl LogMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the buffer with a snapshot
    ///
    /// The snapshot's `latest_sequence` (inclusive) becomes the resume
    /// cursor. Seeding again, for example after a catch-up fetch, merges
    /// instead of replacing. Returns the number of newly held entries.
    pub fn seed(&mut self, page: LogPage) -> usize {
        let before = self.entries.len();

        for entry in page.entries {
            if let Err(idx) = self.position(entry.sequence_number) {
                self.entries.insert(idx, entry);
            }
        }

        let latest = page.latest_sequence.or_else(|| self.highest()).unwrap_or(0);
        self.cursor = self.cursor.max(latest);
        self.advance_cursor();

        self.entries.len() - before
    }

    /// Reconcile one incoming entry with the held view
    ///
    /// Replaying the same entry any number of times leaves the view as if it
    /// had been delivered once.
    pub fn reconcile(&mut self, entry: LogEntry) -> MergeDecision {
        let seq = entry.sequence_number;

        // Steady state: strictly above everything held
        let idx = match self.highest() {
            Some(highest) if seq <= highest => match self.position(seq) {
                Ok(_) => return MergeDecision::Duplicate,
                Err(idx) => idx,
            },
            _ => self.entries.len(),
        };

        if seq <= self.cursor {
            self.anomalies += 1;
            warn!(
                "Dropping log entry #{} of job {}: below resume cursor {} and never seen",
                seq, entry.job_id, self.cursor
            );
            return MergeDecision::OutOfOrder;
        }

        self.entries.insert(idx, entry);
        self.advance_cursor();
        MergeDecision::Accept
    }

    /// Held entries, ascending by sequence number
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last sequence number consumed without holes
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn highest(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence_number)
    }

    /// Count of data-integrity anomalies seen so far
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Sequence ranges missing between the cursor and the highest held entry
    pub fn gaps(&self) -> Vec<RangeInclusive<u64>> {
        self.missing_after(self.cursor)
    }

    /// Sequence ranges missing between `after` (exclusive) and the highest
    /// held entry
    pub fn missing_after(&self, after: u64) -> Vec<RangeInclusive<u64>> {
        let (Some(from), Some(to)) = (after.checked_add(1), self.highest()) else {
            return Vec::new();
        };
        if from > to {
            return Vec::new();
        }

        let mut missing = Vec::new();
        let mut expected = Some(from);
        let start = self.entries.partition_point(|e| e.sequence_number < from);

        for entry in &self.entries[start..] {
            let Some(next) = expected else {
                break;
            };
            if entry.sequence_number > next {
                missing.push(next..=entry.sequence_number - 1);
            }
            expected = entry.sequence_number.checked_add(1);
        }
        missing
    }

    fn position(&self, seq: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&seq, |e| e.sequence_number)
    }

    fn advance_cursor(&mut self) {
        let start = self.entries.partition_point(|e| e.sequence_number <= self.cursor);
        for entry in &self.entries[start..] {
            if entry.sequence_number != self.cursor + 1 {
                break;
            }
            self.cursor = entry.sequence_number;
        }
    }
}
