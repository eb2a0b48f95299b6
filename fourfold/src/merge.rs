//! Streaming regrouping of adapter tuples into aggregate points.
//!
//! The [`AggregationMergeIterator`] pulls [`RawTuple`]s from an adapter in
//! arrival order and feeds every tuple of the current `(union_group,
//! bucket_key)` into one open [`StatsAggregator`]. When the key changes, or
//! the adapter runs dry, the aggregator is sealed into an [`AggregatePoint`]
//! whose time range comes from the query grid, never from the data.
//!
//! Tuples from different union groups are never coalesced, even when their
//! bucket keys coincide. Only the bucket being built is held in memory.
//!
//! Buckets without data are handled by [`GapPolicy`]. With the default
//! [`GapPolicy::EmitEmpty`] every union group that appears in the stream tiles
//! the whole grid, so a caller always receives `bucket_count` points per
//! group and can zip them against the grid.

use std::iter::Peekable;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{MeasureId, OrderingGuard, RawTuple};
use crate::error::Result;
use crate::range::BucketGrid;
use crate::stats::{AggregatePoint, BucketKey, StatsAggregator};

/// What to do with buckets that received no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Emit a point with an empty measure map.
    #[default]
    EmitEmpty,
    /// Skip the bucket.
    Omit,
}

/// Pull-based grouping engine over a tuple stream.
#[derive(Debug)]
pub struct AggregationMergeIterator<I>
where
    I: Iterator<Item = Result<RawTuple>>,
{
    tuples: Peekable<I>,
    grid: BucketGrid,
    gaps: GapPolicy,
    guard: OrderingGuard,
    aggregator: StatsAggregator,
    /// Next bucket to tile in the current union group.
    fill: Option<BucketKey>,
    lookahead: Option<Result<AggregatePoint>>,
    sealed: u64,
    done: bool,
}

impl<I> AggregationMergeIterator<I>
where
    I: Iterator<Item = Result<RawTuple>>,
{
    /// Creates an iterator over `tuples` for a query on `grid`.
    pub fn new<T>(tuples: T, grid: BucketGrid, measures: &[MeasureId], gaps: GapPolicy) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            tuples: tuples.into_iter().peekable(),
            guard: OrderingGuard::new(&grid, u32::MAX),
            grid,
            gaps,
            aggregator: StatsAggregator::open(measures),
            fill: None,
            lookahead: None,
            sealed: 0,
            done: false,
        }
    }

    /// Returns `true` if another point (or an error) is available.
    pub fn has_next(&mut self) -> bool {
        if self.lookahead.is_none() {
            self.lookahead = self.pull();
        }
        self.lookahead.is_some()
    }

    /// Number of buckets sealed from data so far.
    pub fn sealed_count(&self) -> u64 {
        self.sealed
    }

    /// The grid points are placed on.
    pub fn grid(&self) -> &BucketGrid {
        &self.grid
    }

    fn pull(&mut self) -> Option<Result<AggregatePoint>> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(point)) => Some(Ok(point)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn advance(&mut self) -> Result<Option<AggregatePoint>> {
        loop {
            let head = match self.tuples.peek() {
                None => None,
                Some(Ok(tuple)) => Some(BucketKey::new(tuple.union_group, tuple.bucket_key)),
                Some(Err(_)) => {
                    return match self.tuples.next() {
                        Some(Err(e)) => Err(e),
                        _ => Ok(None),
                    };
                }
            };

            if self.gaps == GapPolicy::EmitEmpty
                && let Some(gap) = self.next_gap(head)
            {
                return Ok(Some(self.empty_point(gap)));
            }

            let Some(key) = head else {
                return Ok(None);
            };
            if let Some(point) = self.accumulate(key)? {
                return Ok(Some(point));
            }
        }
    }

    /// The empty bucket to emit before `head`, if any.
    fn next_gap(&mut self, head: Option<BucketKey>) -> Option<BucketKey> {
        let count = self.grid.bucket_count();
        let fill = match (self.fill, head) {
            (None, Some(head)) => {
                let start = BucketKey::new(head.union_group, 0);
                self.fill = Some(start);
                start
            }
            // An empty stream still tiles group 0.
            (None, None) => {
                let start = BucketKey::new(0, 0);
                self.fill = Some(start);
                start
            }
            (Some(fill), Some(head)) if fill.index >= count && head.union_group > fill.union_group => {
                let start = BucketKey::new(head.union_group, 0);
                self.fill = Some(start);
                start
            }
            (Some(fill), _) => fill,
        };

        if fill.index >= count {
            return None;
        }
        match head {
            Some(head) if head <= fill => None,
            _ => Some(fill),
        }
    }

    fn empty_point(&mut self, key: BucketKey) -> AggregatePoint {
        self.fill = Some(BucketKey::new(key.union_group, key.index + 1));
        AggregatePoint::empty(key, self.grid.bucket_range(key.index))
    }

    /// Feeds every tuple of `key` into the aggregator and seals it.
    ///
    /// Returns `None` for a bucket whose tuples carried only nulls when gaps
    /// are omitted.
    fn accumulate(&mut self, key: BucketKey) -> Result<Option<AggregatePoint>> {
        loop {
            match self.tuples.peek() {
                Some(Ok(tuple)) if BucketKey::new(tuple.union_group, tuple.bucket_key) == key => {}
                Some(Err(_)) => {
                    return match self.tuples.next() {
                        Some(Err(e)) => Err(e),
                        _ => Ok(None),
                    };
                }
                _ => break,
            }
            let Some(Ok(tuple)) = self.tuples.next() else {
                break;
            };
            self.guard.check(&tuple)?;
            self.aggregator.accept(tuple.measure, tuple.timestamp, tuple.value)?;
        }

        let point = self.aggregator.seal(key, self.grid.bucket_range(key.index));
        self.fill = Some(BucketKey::new(key.union_group, key.index + 1));
        self.sealed += 1;
        debug!(
            union_group = key.union_group,
            bucket = key.index,
            measures = point.measures.len(),
            "sealed bucket"
        );

        if point.is_empty() && self.gaps == GapPolicy::Omit {
            return Ok(None);
        }
        Ok(Some(point))
    }
}

impl<I> Iterator for AggregationMergeIterator<I>
where
    I: Iterator<Item = Result<RawTuple>>,
{
    type Item = Result<AggregatePoint>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lookahead.take() {
            Some(item) => Some(item),
            None => self.pull(),
        }
    }
}
