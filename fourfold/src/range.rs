//! Time ranges and the regular bucket grid of an M4 query.
//!
//! All timestamps are epoch milliseconds. Ranges are half-open `[from, to)`
//! everywhere in the crate: file scans, bucket boundaries and clamping use the
//! same convention.
//!
//! A [`BucketGrid`] splits a query range into `bucket_count` buckets of width
//! `(to - from) / bucket_count`. The final bucket absorbs the rounding
//! remainder and always ends at `to`, so the buckets tile the range exactly.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// An immutable half-open time range `[from, to)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    from: i64,
    to: i64,
}

impl TimeRange {
    /// Creates a new range.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `from > to`.
    pub fn new(from: i64, to: i64) -> Result<Self> {
        if from > to {
            return Err(QueryError::InvalidTimeRange { from, to }.into());
        }
        Ok(Self { from, to })
    }

    /// Start of the range (inclusive).
    pub fn from(&self) -> i64 {
        self.from
    }

    /// End of the range (exclusive).
    pub fn to(&self) -> i64 {
        self.to
    }

    /// Returns `true` if `timestamp` lies in `[from, to)`.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.from && timestamp < self.to
    }

    /// Returns `true` if the range covers no instant.
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    /// Length of the range in milliseconds.
    ///
    /// Unsigned, since a valid range can span more than `i64::MAX`.
    pub fn duration(&self) -> u64 {
        self.to.abs_diff(self.from)
    }

    /// Returns the overlap of two ranges, or `None` if they are disjoint.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from < to).then_some(TimeRange { from, to })
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Regular partition of a query range into `bucket_count` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrid {
    range: TimeRange,
    bucket_count: u32,
    width: i64,
}

impl BucketGrid {
    /// Creates a grid over `range`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidBucketCount`] if `bucket_count` is zero or
    /// larger than the range is long (which would give zero-width buckets), or
    /// if a single bucket would be wider than `i64::MAX`.
    pub fn new(range: TimeRange, bucket_count: u32) -> Result<Self> {
        let invalid = QueryError::InvalidBucketCount {
            count: bucket_count,
            from: range.from,
            to: range.to,
        };
        if bucket_count == 0 {
            return Err(invalid.into());
        }

        let width = range.duration() / u64::from(bucket_count);
        let width = match i64::try_from(width) {
            Ok(width) if width > 0 => width,
            _ => return Err(invalid.into()),
        };

        Ok(Self {
            range,
            bucket_count,
            width,
        })
    }

    /// The range the grid covers.
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Nominal bucket width in milliseconds.
    pub fn width(&self) -> i64 {
        self.width
    }

    /// Returns the time range of bucket `index`.
    ///
    /// Buckets start at `from + index * width`; the last bucket extends to
    /// `to`. Indices past the end are clamped to the last bucket.
    pub fn bucket_range(&self, index: u32) -> TimeRange {
        let index = index.min(self.bucket_count - 1);
        // The offset may exceed i64 even though the sum stays within [from, to].
        let offset = i128::from(index) * i128::from(self.width);
        let from = i64::try_from(i128::from(self.range.from) + offset).unwrap_or(self.range.to);
        let to = if index == self.bucket_count - 1 {
            self.range.to
        } else {
            from.saturating_add(self.width).min(self.range.to)
        };
        TimeRange { from, to }
    }

    /// Returns the index of the bucket containing `timestamp`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // bounded by bucket_count
    pub fn bucket_of(&self, timestamp: i64) -> Option<u32> {
        if !self.range.contains(timestamp) {
            return None;
        }
        let index = timestamp.abs_diff(self.range.from) / self.width as u64;
        Some(index.min(u64::from(self.bucket_count - 1)) as u32)
    }

    /// Iterates over all bucket ranges in order.
    pub fn buckets(&self) -> impl Iterator<Item = TimeRange> + '_ {
        (0..self.bucket_count).map(|index| self.bucket_range(index))
    }
}
