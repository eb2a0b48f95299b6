//! M4 query execution over files and backend cursors.
//!
//! A query names a time range, a bucket count and the measures to summarize.
//! It runs along one of two paths that share the same merge engine:
//!
//! - **file path** ([`run_file`]) - the range is clamped to the file, located
//!   by interpolation search and scanned lazily; each record becomes raw
//!   tuples that are summarized bucket by bucket;
//! - **stream path** ([`run_stream`]) - a backend cursor already wrapped in a
//!   [`BackendAdapter`] is regrouped into points.
//!
//! Both return a [`QueryResult`] that wraps the lazy point stream with
//! metadata about what was actually served.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! # use fourfold::{DatasetConfig, FileSource, M4Query, MeasureId, TimeRange};
//! # use fourfold::query::run_file;
//! let config = DatasetConfig::new("./metrics.csv", vec!["cpu".to_string()]);
//! let mut source = FileSource::open(&config)?;
//!
//! let query = M4Query::new(TimeRange::new(0, 60_000)?, 600, vec![MeasureId(0)])?;
//! let result = run_file(&mut source, &query)?;
//! if result.may_be_incomplete() {
//!     println!("file only covers {:?}", result.served_range());
//! }
//! for point in result {
//!     let point = point?;
//!     println!("{} {:?}", point.bucket, point.get(MeasureId(0)));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use tracing::debug;

use crate::access::{FileSource, TimeIndexed};
use crate::adapter::{AdapterContext, BackendAdapter, MeasureId, RecordTuples};
use crate::error::{QueryError, Result};
use crate::merge::{AggregationMergeIterator, GapPolicy};
use crate::range::{BucketGrid, TimeRange};
use crate::stats::AggregatePoint;

/// A validated M4 request.
#[derive(Debug, Clone, PartialEq)]
pub struct M4Query {
    grid: BucketGrid,
    measures: Vec<MeasureId>,
    gaps: GapPolicy,
}

impl M4Query {
    /// Creates a query with the default gap policy.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoMeasures`] if `measures` is empty and
    /// [`QueryError::InvalidBucketCount`] if the range cannot be split into
    /// `bucket_count` non-empty buckets.
    pub fn new(range: TimeRange, bucket_count: u32, measures: Vec<MeasureId>) -> Result<Self> {
        if measures.is_empty() {
            return Err(QueryError::NoMeasures.into());
        }
        Ok(Self {
            grid: BucketGrid::new(range, bucket_count)?,
            measures,
            gaps: GapPolicy::default(),
        })
    }

    /// Sets how empty buckets are reported.
    #[must_use]
    pub fn with_gaps(mut self, gaps: GapPolicy) -> Self {
        self.gaps = gaps;
        self
    }

    /// The requested range.
    pub fn range(&self) -> TimeRange {
        self.grid.range()
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.grid.bucket_count()
    }

    /// Measures to summarize.
    pub fn measures(&self) -> &[MeasureId] {
        &self.measures
    }

    /// Gap policy.
    pub fn gaps(&self) -> GapPolicy {
        self.gaps
    }

    /// The bucket grid over the requested range.
    pub fn grid(&self) -> BucketGrid {
        self.grid
    }
}

/// Result of an M4 query.
///
/// Iterates lazily over the aggregate points. The first error ends the
/// stream; no point after a corrupt record or a protocol violation is ever
/// produced.
#[derive(Debug)]
pub struct QueryResult<'a> {
    points: AggregationMergeIterator<BackendAdapter<'a>>,
    requested_range: TimeRange,
    served_range: TimeRange,
    may_be_incomplete: bool,
}

impl<'a> QueryResult<'a> {
    fn new(
        points: AggregationMergeIterator<BackendAdapter<'a>>,
        requested_range: TimeRange,
        served_range: TimeRange,
    ) -> Self {
        Self {
            points,
            requested_range,
            served_range,
            may_be_incomplete: served_range != requested_range,
        }
    }

    /// The range that was requested. Buckets are laid out over this range.
    pub fn requested_range(&self) -> TimeRange {
        self.requested_range
    }

    /// The part of the requested range the source could serve.
    pub fn served_range(&self) -> TimeRange {
        self.served_range
    }

    /// Returns `true` when the source covers less than the requested range,
    /// so buckets outside the served range are empty for lack of data.
    pub fn may_be_incomplete(&self) -> bool {
        self.may_be_incomplete
    }

    /// Returns `true` if another point (or an error) is available.
    pub fn has_next(&mut self) -> bool {
        self.points.has_next()
    }

    /// Collects all points into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream produced.
    pub fn collect_all(self) -> Result<Vec<AggregatePoint>> {
        self.points.collect()
    }
}

impl Iterator for QueryResult<'_> {
    type Item = Result<AggregatePoint>;

    fn next(&mut self) -> Option<Self::Item> {
        self.points.next()
    }
}

/// Runs `query` against a flat file.
///
/// The bucket grid covers the requested range; the scan covers only the part
/// of it the file holds.
///
/// # Errors
///
/// Returns [`AccessError::OutOfRange`](crate::error::AccessError::OutOfRange)
/// if the range misses the file entirely, and any error raised while
/// positioning the scan. Errors while scanning are yielded by the result.
pub fn run_file<'a>(source: &'a mut FileSource, query: &M4Query) -> Result<QueryResult<'a>> {
    let requested = query.range();
    let served = source.clamp(requested)?;
    let context = AdapterContext::new(query.grid(), source.measures().clone());

    debug!(
        source = source.label(),
        requested = %requested,
        served = %served,
        buckets = query.bucket_count(),
        "running file query"
    );

    let scan = source.scan(served, query.measures())?;
    let tuples = BackendAdapter::from(RecordTuples::new(scan, context));
    let points = AggregationMergeIterator::new(tuples, query.grid(), query.measures(), query.gaps());
    Ok(QueryResult::new(points, requested, served))
}

/// Runs `query` over an adapted backend cursor.
///
/// The backend is trusted to have answered the requested range, so the served
/// range equals the requested one.
pub fn run_stream<'a>(adapter: impl Into<BackendAdapter<'a>>, query: &M4Query) -> QueryResult<'a> {
    let requested = query.range();
    let points =
        AggregationMergeIterator::new(adapter.into(), query.grid(), query.measures(), query.gaps());
    QueryResult::new(points, requested, requested)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::adapter::{MeasureMap, ResultTable, Role, TableAdapter, TableRow};
    use crate::config::DatasetConfig;
    use crate::error::{AccessError, FourfoldError};

    fn csv_source(dir: &tempfile::TempDir) -> FileSource {
        let path = dir.path().join("series.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "time,cpu").unwrap();
        for i in 0..=100 {
            writeln!(file, "{},{}", i * 10, i % 7).unwrap();
        }
        FileSource::open(&DatasetConfig::new(path, vec!["cpu".into()])).unwrap()
    }

    #[test]
    fn test_query_validation() {
        let range = TimeRange::new(0, 100).unwrap();
        assert!(matches!(
            M4Query::new(range, 10, Vec::new()),
            Err(FourfoldError::Query(QueryError::NoMeasures))
        ));
        assert!(M4Query::new(range, 0, vec![MeasureId(0)]).is_err());
        assert!(M4Query::new(range, 101, vec![MeasureId(0)]).is_err());

        let query = M4Query::new(range, 10, vec![MeasureId(0)]).unwrap();
        assert_eq!(query.gaps(), GapPolicy::EmitEmpty);
        assert_eq!(query.grid().width(), 10);
    }

    #[test]
    fn test_run_file_inside_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = csv_source(&dir);

        let query = M4Query::new(TimeRange::new(0, 1_000).unwrap(), 10, vec![MeasureId(0)]).unwrap();
        let result = run_file(&mut source, &query).unwrap();
        assert!(!result.may_be_incomplete());

        let points = result.collect_all().unwrap();
        assert_eq!(points.len(), 10);
        let first = points[0].get(MeasureId(0)).unwrap();
        assert_eq!(first.count, 10);
        assert_eq!((first.min, first.max), (0.0, 6.0));
        assert_eq!(first.first_timestamp, Some(0));
        assert_eq!(first.last_timestamp, Some(90));
    }

    #[test]
    fn test_run_file_overshoot_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = csv_source(&dir);

        let query =
            M4Query::new(TimeRange::new(500, 2_000).unwrap(), 3, vec![MeasureId(0)]).unwrap();
        let result = run_file(&mut source, &query).unwrap();
        assert!(result.may_be_incomplete());
        assert_eq!(result.served_range(), TimeRange::new(500, 1_001).unwrap());
        assert_eq!(result.requested_range(), TimeRange::new(500, 2_000).unwrap());

        let points = result.collect_all().unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].get(MeasureId(0)).unwrap().count, 50);
        assert_eq!(points[1].get(MeasureId(0)).unwrap().count, 1);
        assert!(points[2].is_empty());
    }

    #[test]
    fn test_run_file_disjoint_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = csv_source(&dir);

        let query =
            M4Query::new(TimeRange::new(5_000, 6_000).unwrap(), 3, vec![MeasureId(0)]).unwrap();
        assert!(matches!(
            run_file(&mut source, &query),
            Err(FourfoldError::Access(AccessError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_run_stream_over_tables() {
        let query = M4Query::new(TimeRange::new(0, 100).unwrap(), 2, vec![MeasureId(0)])
            .unwrap()
            .with_gaps(GapPolicy::Omit);
        let context = AdapterContext::new(query.grid(), MeasureMap::new(["cpu"]).unwrap());
        let tables = vec![
            ResultTable {
                role: Role::Min,
                columns: vec!["cpu".into()],
                rows: vec![TableRow::new(10, vec![Some(1.0)])],
            },
            ResultTable {
                role: Role::Max,
                columns: vec!["cpu".into()],
                rows: vec![TableRow::new(20, vec![Some(4.0)])],
            },
        ];

        let mut result = run_stream(TableAdapter::new(tables, context), &query);
        assert!(result.has_next());
        assert!(!result.may_be_incomplete());

        let points = result.collect_all().unwrap();
        assert_eq!(points.len(), 1);
        let stats = points[0].get(MeasureId(0)).unwrap();
        assert_eq!((stats.min, stats.max, stats.count), (1.0, 4.0, 2));
    }
}
