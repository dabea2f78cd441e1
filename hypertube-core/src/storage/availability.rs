//! Merged interval set describing which bytes of a file are on disk.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes in the interval.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Range<u64>> for ByteRange {
    fn from(range: Range<u64>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Disjoint, merged set of byte intervals that are safe to read.
///
/// Intervals never touch or overlap: inserting `[0, 10)` and `[10, 20)`
/// leaves a single `[0, 20)` entry. Coverage only grows; there is no removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceAvailabilityMap {
    /// Interval start -> interval end (exclusive)
    intervals: BTreeMap<u64, u64>,
    covered_bytes: u64,
    total_size: u64,
}

impl PieceAvailabilityMap {
    /// Creates an empty map for a file of `total_size` bytes.
    pub fn new(total_size: u64) -> Self {
        Self {
            intervals: BTreeMap::new(),
            covered_bytes: 0,
            total_size,
        }
    }

    /// Creates a map where every byte of the file is present.
    pub fn complete(total_size: u64) -> Self {
        let mut map = Self::new(total_size);
        map.insert(0..total_size);
        map
    }

    /// Marks `range` as present, merging with neighbours.
    ///
    /// The range is clipped to the file size. Returns the number of bytes
    /// that were not covered before.
    pub fn insert(&mut self, range: Range<u64>) -> u64 {
        let mut start = range.start;
        let mut end = range.end.min(self.total_size);
        if start >= end {
            return 0;
        }

        if let Some((&prev_start, &prev_end)) = self.intervals.range(..=start).next_back() {
            if prev_end >= start {
                if prev_end >= end {
                    return 0;
                }
                start = prev_start;
            }
        }

        let absorbed: Vec<(u64, u64)> = self
            .intervals
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut removed = 0;
        for (s, e) in absorbed {
            self.intervals.remove(&s);
            removed += e - s;
            end = end.max(e);
        }

        self.intervals.insert(start, end);
        let merged = end - start;
        self.covered_bytes = self.covered_bytes - removed + merged;
        merged - removed
    }

    /// True iff every byte of `range` lies inside a single interval.
    pub fn covers(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        self.intervals
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }

    /// Intervals intersecting `[offset, total)`, ascending, the first one
    /// clipped so it starts no earlier than `offset`.
    pub fn ranges_from(&self, offset: u64) -> Vec<ByteRange> {
        let mut ranges = Vec::new();
        if let Some((_, &end)) = self.intervals.range(..offset).next_back() {
            if end > offset {
                ranges.push(ByteRange::new(offset, end));
            }
        }
        ranges.extend(
            self.intervals
                .range(offset..)
                .map(|(&start, &end)| ByteRange::new(start, end)),
        );
        ranges
    }

    /// All intervals in ascending order.
    pub fn ranges(&self) -> Vec<ByteRange> {
        self.ranges_from(0)
    }

    pub fn covered_bytes(&self) -> u64 {
        self.covered_bytes
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// True once `[0, total_size)` is fully covered.
    pub fn is_complete(&self) -> bool {
        self.total_size > 0 && self.covered_bytes == self.total_size
    }

    /// Covered fraction in percent (0.0 to 100.0).
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.covered_bytes as f64 * 100.0 / self.total_size as f64
    }
}
