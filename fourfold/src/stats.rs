//! Per-bucket M4 statistics.
//!
//! A [`StatsAggregator`] is the mutable accumulator for one open bucket. It
//! accepts `(measure, timestamp, value)` observations and is sealed into an
//! immutable [`AggregatePoint`] when the bucket closes.
//!
//! `min` and `max` are numeric extremes. `first` and `last` are temporal: the
//! values observed at the smallest and largest timestamp, independent of
//! value. Observations tagged by a backend as min/max carriers are accepted as
//! ordinary observations and the statistics are re-derived from them.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::adapter::MeasureId;
use crate::error::{AdapterError, Result};
use crate::range::TimeRange;

/// Identity of a bucket within a merged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BucketKey {
    /// Sub-query the bucket belongs to.
    pub union_group: u32,
    /// Bucket index within the query grid.
    pub index: u32,
}

impl BucketKey {
    /// Creates a key.
    pub fn new(union_group: u32, index: u32) -> Self {
        Self { union_group, index }
    }
}

/// M4 statistics of one measure inside one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasureStats {
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Value at the earliest timestamp.
    pub first: f64,
    /// Value at the latest timestamp.
    pub last: f64,
    /// Timestamp of `first`, if any observation carried one.
    pub first_timestamp: Option<i64>,
    /// Timestamp of `last`, if any observation carried one.
    pub last_timestamp: Option<i64>,
    /// Number of accepted observations.
    pub count: u64,
}

impl MeasureStats {
    fn new(timestamp: Option<i64>, value: f64) -> Self {
        Self {
            min: value,
            max: value,
            first: value,
            last: value,
            first_timestamp: timestamp,
            last_timestamp: timestamp,
            count: 1,
        }
    }

    fn accept(&mut self, timestamp: Option<i64>, value: f64) {
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }

        // A timed observation always displaces an untimed one; among timed
        // ones the strict comparison keeps the earliest accepted on ties.
        if let Some(t) = timestamp {
            if self.first_timestamp.is_none_or(|first| t < first) {
                self.first = value;
                self.first_timestamp = Some(t);
            }
            if self.last_timestamp.is_none_or(|last| t > last) {
                self.last = value;
                self.last_timestamp = Some(t);
            }
        }
    }
}

/// The sealed summary of one bucket.
///
/// Measures with no observations in the bucket are absent from `measures`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatePoint {
    /// Which bucket this is.
    pub key: BucketKey,
    /// Time range of the bucket, derived from the query grid.
    pub bucket: TimeRange,
    /// Statistics per measure.
    pub measures: BTreeMap<MeasureId, MeasureStats>,
}

impl AggregatePoint {
    /// Creates a point with no measures.
    pub fn empty(key: BucketKey, bucket: TimeRange) -> Self {
        Self {
            key,
            bucket,
            measures: BTreeMap::new(),
        }
    }

    /// Returns `true` if no measure had data in this bucket.
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    /// Statistics for `measure`, if it had data.
    pub fn get(&self, measure: MeasureId) -> Option<&MeasureStats> {
        self.measures.get(&measure)
    }
}

/// Accumulator for the bucket currently being built.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    active: BTreeSet<MeasureId>,
    stats: BTreeMap<MeasureId, MeasureStats>,
}

impl StatsAggregator {
    /// Opens an aggregator accepting observations for `measures`.
    pub fn open(measures: &[MeasureId]) -> Self {
        Self {
            active: measures.iter().copied().collect(),
            stats: BTreeMap::new(),
        }
    }

    /// Accepts one observation.
    ///
    /// Null and non-finite values are ignored and not counted.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::UnknownMeasure`] if `measure` was not part of
    /// the set the aggregator was opened with.
    pub fn accept(
        &mut self,
        measure: MeasureId,
        timestamp: Option<i64>,
        value: Option<f64>,
    ) -> Result<()> {
        if !self.active.contains(&measure) {
            return Err(AdapterError::UnknownMeasure {
                measure: measure.to_string(),
            }
            .into());
        }

        let Some(value) = value.filter(|v| v.is_finite()) else {
            return Ok(());
        };

        self.stats
            .entry(measure)
            .and_modify(|s| s.accept(timestamp, value))
            .or_insert_with(|| MeasureStats::new(timestamp, value));
        Ok(())
    }

    /// Returns `true` if nothing has been accepted since the last seal.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Seals the accumulated statistics into a point and resets the aggregator.
    pub fn seal(&mut self, key: BucketKey, bucket: TimeRange) -> AggregatePoint {
        AggregatePoint {
            key,
            bucket,
            measures: std::mem::take(&mut self.stats),
        }
    }
}
