//! Adapter for relational result sets.
//!
//! A relational M4 query returns one row per measure and bucket, in one of two
//! flavors:
//!
//! - **bucket** rows `(measure, bucket_key, min, max, union_group)` carry the
//!   numeric extremes already computed by the database;
//! - **point** rows `(measure, min_timestamp, max_timestamp, value,
//!   union_group)` carry a value observed over a time span, and the bucket is
//!   derived from the timestamps through the query grid.
//!
//! Rows are turned into [`RawTuple`]s one at a time. The adapter tracks union
//! group and bucket key transitions but leaves sealing to the merge engine.

use rusqlite::Statement;
use tracing::{debug, trace};

use super::{AdapterContext, MeasureId, OrderingGuard, RawTuple, Role};
use crate::error::{AdapterError, FourfoldError, Result};

/// Shape of the rows a relational query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlavor {
    /// `(measure, bucket_key, min, max, union_group)`.
    Bucket,
    /// `(measure, min_timestamp, max_timestamp, value, union_group)`.
    Point,
}

/// One decoded relational row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelationalRow {
    /// Pre-aggregated extremes of one bucket.
    Bucket {
        /// The measure.
        measure: MeasureId,
        /// Bucket index within the grid.
        bucket_key: u32,
        /// Minimum value, `None` if the bucket had only nulls.
        min: Option<f64>,
        /// Maximum value.
        max: Option<f64>,
        /// Sub-query the row came from.
        union_group: u32,
    },
    /// A value observed between two timestamps of the same bucket.
    Point {
        /// The measure.
        measure: MeasureId,
        /// Earliest timestamp carrying `value`.
        min_timestamp: i64,
        /// Latest timestamp carrying `value`.
        max_timestamp: i64,
        /// The observed value.
        value: Option<f64>,
        /// Sub-query the row came from.
        union_group: u32,
    },
}

/// Turns a relational row cursor into raw tuples.
pub struct RelationalAdapter<'a> {
    rows: Box<dyn Iterator<Item = Result<RelationalRow>> + 'a>,
    context: AdapterContext,
    guard: OrderingGuard,
    pending: Option<RawTuple>,
    last_key: Option<(u32, u32)>,
    transitions: u64,
    done: bool,
}

impl std::fmt::Debug for RelationalAdapter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalAdapter")
            .field("pending", &self.pending)
            .field("transitions", &self.transitions)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'a> RelationalAdapter<'a> {
    /// Wraps a row cursor.
    pub fn new<I>(rows: I, context: AdapterContext) -> Self
    where
        I: IntoIterator<Item = Result<RelationalRow>>,
        I::IntoIter: 'a,
    {
        let guard = context.guard();
        Self {
            rows: Box::new(rows.into_iter()),
            context,
            guard,
            pending: None,
            last_key: None,
            transitions: 0,
            done: false,
        }
    }

    /// Number of `(union_group, bucket_key)` changes seen so far.
    ///
    /// Diagnostic only: the merge engine finds bucket boundaries from the
    /// tuples themselves. Logged at debug level when the cursor is exhausted.
    pub fn bucket_transitions(&self) -> u64 {
        self.transitions
    }

    fn expand(&mut self, row: RelationalRow) -> Result<(RawTuple, Option<RawTuple>)> {
        match row {
            RelationalRow::Bucket {
                measure,
                bucket_key,
                min,
                max,
                union_group,
            } => {
                self.check_measure(measure)?;
                let base = RawTuple {
                    union_group,
                    bucket_key,
                    measure,
                    role: Role::Min,
                    timestamp: None,
                    value: min,
                };
                Ok((
                    base,
                    Some(RawTuple {
                        role: Role::Max,
                        value: max,
                        ..base
                    }),
                ))
            }
            RelationalRow::Point {
                measure,
                min_timestamp,
                max_timestamp,
                value,
                union_group,
            } => {
                self.check_measure(measure)?;
                if min_timestamp > max_timestamp {
                    return Err(AdapterError::protocol(format!(
                        "point row spans backwards: {min_timestamp} > {max_timestamp}"
                    ))
                    .into());
                }
                let bucket_key = self.context.bucket_of(min_timestamp)?;
                if self.context.bucket_of(max_timestamp)? != bucket_key {
                    return Err(AdapterError::protocol(format!(
                        "point row [{min_timestamp}, {max_timestamp}] spans two buckets"
                    ))
                    .into());
                }
                let first = RawTuple {
                    union_group,
                    bucket_key,
                    measure,
                    role: Role::First,
                    timestamp: Some(min_timestamp),
                    value,
                };
                let last = (max_timestamp != min_timestamp).then_some(RawTuple {
                    role: Role::Last,
                    timestamp: Some(max_timestamp),
                    ..first
                });
                Ok((first, last))
            }
        }
    }

    fn check_measure(&self, measure: MeasureId) -> Result<()> {
        if self.context.measures.contains(measure) {
            Ok(())
        } else {
            Err(AdapterError::UnknownMeasure {
                measure: measure.to_string(),
            }
            .into())
        }
    }

    fn advance(&mut self) -> Result<Option<RawTuple>> {
        if let Some(tuple) = self.pending.take() {
            return Ok(Some(tuple));
        }
        let Some(row) = self.rows.next().transpose()? else {
            return Ok(None);
        };

        let (tuple, follow) = self.expand(row)?;
        self.guard.check(&tuple)?;

        let key = (tuple.union_group, tuple.bucket_key);
        if self.last_key != Some(key) {
            if self.last_key.is_some() {
                self.transitions += 1;
                trace!(union_group = key.0, bucket = key.1, "relational cursor crossed a bucket");
            }
            self.last_key = Some(key);
        }

        self.pending = follow;
        Ok(Some(tuple))
    }
}

impl Iterator for RelationalAdapter<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => {
                self.done = true;
                debug!(transitions = self.transitions, "relational cursor exhausted");
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Runs a prepared statement and decodes its rows in the given flavor.
///
/// Columns are read by position in the order documented on [`RowFlavor`].
/// Integer columns that are negative or do not fit are protocol violations.
///
/// # Errors
///
/// Returns [`AdapterError::Sql`] if the statement cannot be executed.
/// Per-row decoding failures are yielded by the iterator.
///
/// # Examples
///
/// ```rust
/// use fourfold::adapter::relational::{sqlite_rows, RelationalRow, RowFlavor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = rusqlite::Connection::open_in_memory()?;
/// let mut stmt = conn.prepare("SELECT 0, 3, 1.5, 9.0, 0")?;
/// let rows: Vec<_> = sqlite_rows(&mut stmt, RowFlavor::Bucket)?.collect::<Result<_, _>>()?;
/// assert!(matches!(rows[0], RelationalRow::Bucket { bucket_key: 3, .. }));
/// # Ok(())
/// # }
/// ```
pub fn sqlite_rows<'s>(
    stmt: &'s mut Statement<'_>,
    flavor: RowFlavor,
) -> Result<impl Iterator<Item = Result<RelationalRow>> + 's> {
    let rows = stmt
        .query_map([], move |row| decode_row(row, flavor))
        .map_err(sql_error)?;

    Ok(rows.map(|decoded| decoded.map_err(sql_error).and_then(|row| row)))
}

fn decode_row(row: &rusqlite::Row<'_>, flavor: RowFlavor) -> rusqlite::Result<Result<RelationalRow>> {
    let measure = row.get::<_, i64>(0)?;
    let union_group = row.get::<_, i64>(4)?;

    Ok(match flavor {
        RowFlavor::Bucket => {
            let bucket_key = row.get::<_, i64>(1)?;
            let min = row.get::<_, Option<f64>>(2)?;
            let max = row.get::<_, Option<f64>>(3)?;
            to_u32("measure", measure).and_then(|measure| {
                Ok(RelationalRow::Bucket {
                    measure: MeasureId(measure),
                    bucket_key: to_u32("bucket key", bucket_key)?,
                    min,
                    max,
                    union_group: to_u32("union group", union_group)?,
                })
            })
        }
        RowFlavor::Point => {
            let min_timestamp = row.get::<_, i64>(1)?;
            let max_timestamp = row.get::<_, i64>(2)?;
            let value = row.get::<_, Option<f64>>(3)?;
            to_u32("measure", measure).and_then(|measure| {
                Ok(RelationalRow::Point {
                    measure: MeasureId(measure),
                    min_timestamp,
                    max_timestamp,
                    value,
                    union_group: to_u32("union group", union_group)?,
                })
            })
        }
    })
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        AdapterError::protocol(format!("{column} {value} is not a valid index")).into()
    })
}

fn sql_error(source: rusqlite::Error) -> FourfoldError {
    AdapterError::Sql { source }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MeasureMap;
    use crate::range::{BucketGrid, TimeRange};

    fn context() -> AdapterContext {
        let grid = BucketGrid::new(TimeRange::new(0, 1_000).unwrap(), 10).unwrap();
        AdapterContext::new(grid, MeasureMap::new(["a", "b"]).unwrap()).with_union_groups(2)
    }

    fn bucket_row(measure: u32, bucket_key: u32, union_group: u32) -> Result<RelationalRow> {
        Ok(RelationalRow::Bucket {
            measure: MeasureId(measure),
            bucket_key,
            min: Some(1.0),
            max: Some(2.0),
            union_group,
        })
    }

    #[test]
    fn test_bucket_rows_expand_to_min_and_max() {
        let rows = vec![bucket_row(0, 0, 0), bucket_row(1, 0, 0), bucket_row(0, 4, 0)];
        let mut adapter = RelationalAdapter::new(rows, context());
        let tuples: Vec<RawTuple> = adapter.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(tuples.len(), 6);
        assert_eq!(tuples[0].role, Role::Min);
        assert_eq!(tuples[1].role, Role::Max);
        assert_eq!(tuples[3].measure, MeasureId(1));
        assert_eq!(tuples[5].bucket_key, 4);
        assert_eq!(adapter.bucket_transitions(), 1);
    }

    #[test]
    fn test_point_rows_map_through_grid() {
        let rows = vec![
            Ok(RelationalRow::Point {
                measure: MeasureId(0),
                min_timestamp: 120,
                max_timestamp: 180,
                value: Some(3.0),
                union_group: 0,
            }),
            Ok(RelationalRow::Point {
                measure: MeasureId(0),
                min_timestamp: 250,
                max_timestamp: 250,
                value: Some(4.0),
                union_group: 0,
            }),
        ];
        let tuples: Vec<RawTuple> = RelationalAdapter::new(rows, context())
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(tuples.len(), 3);
        assert_eq!((tuples[0].role, tuples[0].timestamp), (Role::First, Some(120)));
        assert_eq!((tuples[1].role, tuples[1].timestamp), (Role::Last, Some(180)));
        assert_eq!(tuples[2].bucket_key, 2);
    }

    #[test]
    fn test_point_spanning_buckets_is_protocol_error() {
        let rows = vec![Ok(RelationalRow::Point {
            measure: MeasureId(0),
            min_timestamp: 150,
            max_timestamp: 250,
            value: Some(1.0),
            union_group: 0,
        })];
        let mut adapter = RelationalAdapter::new(rows, context());
        assert!(matches!(
            adapter.next(),
            Some(Err(FourfoldError::Adapter(AdapterError::Protocol { .. })))
        ));
        assert!(adapter.next().is_none());
    }

    #[test]
    fn test_reordered_cursor_fails() {
        let rows = vec![bucket_row(0, 5, 0), bucket_row(0, 2, 0)];
        let results: Vec<Result<RawTuple>> = RelationalAdapter::new(rows, context()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }

    #[test]
    fn test_unknown_measure() {
        let rows = vec![bucket_row(7, 0, 0)];
        let mut adapter = RelationalAdapter::new(rows, context());
        assert!(matches!(
            adapter.next(),
            Some(Err(FourfoldError::Adapter(AdapterError::UnknownMeasure { .. })))
        ));
    }

    #[test]
    fn test_sqlite_rows_decoding() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT 1, 100, 300, NULL, 1 UNION ALL SELECT -1, 0, 0, 1.0, 0")
            .unwrap();
        let rows: Vec<Result<RelationalRow>> =
            sqlite_rows(&mut stmt, RowFlavor::Point).unwrap().collect();

        assert_eq!(
            *rows[0].as_ref().unwrap(),
            RelationalRow::Point {
                measure: MeasureId(1),
                min_timestamp: 100,
                max_timestamp: 300,
                value: None,
                union_group: 1,
            }
        );
        assert!(rows[1].is_err());
    }
}
