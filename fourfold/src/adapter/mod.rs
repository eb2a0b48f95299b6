//! Backend result adapters.
//!
//! Every backend answers an M4 query with its own cursor shape: SQL rows,
//! per-role result tables, Arrow record batches, or (for flat files) raw
//! records. An adapter turns one of those cursors into a stream of
//! [`RawTuple`]s in arrival order. Adapters never reorder and never seal
//! buckets; that is the job of the [merge engine](crate::merge).
//!
//! Each adapter checks its output with an [`OrderingGuard`] so a cursor that
//! goes backwards, or names a bucket outside the grid, fails loudly with
//! [`AdapterError::Protocol`] instead of producing a wrong chart.

pub mod arrow;
pub mod records;
pub mod relational;
pub mod table;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{AdapterError, ConfigError, Result};
use crate::range::BucketGrid;

pub use self::arrow::{ArrowAdapter, ArrowBinding};
pub use self::records::RecordTuples;
pub use self::relational::{RelationalAdapter, RelationalRow, RowFlavor};
pub use self::table::{ResultTable, TableAdapter, TableRow};

/// Identifier of a measure within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MeasureId(pub u32);

impl fmt::Display for MeasureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bijective mapping between measure ids and names.
///
/// Ids are assigned by position: the first name is `MeasureId(0)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureMap {
    names: Vec<String>,
}

impl MeasureMap {
    /// Builds a mapping from names in id order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a name appears twice.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if list.contains(&name) {
                return Err(ConfigError::Invalid {
                    reason: format!("measure '{name}' listed twice"),
                }
                .into());
            }
            list.push(name);
        }
        Ok(Self { names: list })
    }

    /// Number of measures.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if the mapping holds no measures.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All ids in order.
    #[allow(clippy::cast_possible_truncation)] // measure lists are tiny
    pub fn ids(&self) -> Vec<MeasureId> {
        (0..self.names.len() as u32).map(MeasureId).collect()
    }

    /// Id of the measure called `name`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn id_of(&self, name: &str) -> Option<MeasureId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| MeasureId(i as u32))
    }

    /// Name of measure `id`.
    pub fn name_of(&self, id: MeasureId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Returns `true` if `id` belongs to this mapping.
    pub fn contains(&self, id: MeasureId) -> bool {
        (id.0 as usize) < self.names.len()
    }

    /// Id of `name`, or an error naming it.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::UnknownMeasure`] if the name is not mapped.
    pub fn resolve(&self, name: &str) -> Result<MeasureId> {
        self.id_of(name).ok_or_else(|| {
            AdapterError::UnknownMeasure {
                measure: name.to_string(),
            }
            .into()
        })
    }

    /// Names in id order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// What an observation represents within its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The bucket's minimum.
    Min,
    /// The bucket's maximum.
    Max,
    /// The value at the bucket's earliest timestamp.
    First,
    /// The value at the bucket's latest timestamp.
    Last,
    /// An unaggregated sample.
    Raw,
}

impl Role {
    /// Returns `true` if an observation in this role is placed by its timestamp.
    ///
    /// `min` and `max` rows are stamped with the bucket start by most engines,
    /// so their timestamps are not used for first/last ordering.
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::First | Self::Last | Self::Raw)
    }
}

impl FromStr for Role {
    type Err = AdapterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "raw" => Ok(Self::Raw),
            other => Err(AdapterError::protocol(format!("unknown role '{other}'"))),
        }
    }
}

/// One observation produced by an adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTuple {
    /// Sub-query the observation came from.
    pub union_group: u32,
    /// Bucket index within the query grid.
    pub bucket_key: u32,
    /// The measure observed.
    pub measure: MeasureId,
    /// What the observation represents.
    pub role: Role,
    /// When it was observed, if the backend reported it.
    pub timestamp: Option<i64>,
    /// The value; `None` for nulls and omitted fields.
    pub value: Option<f64>,
}

/// What every adapter needs to know about the query it serves.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// The query's bucket grid.
    pub grid: BucketGrid,
    /// Measure id/name mapping.
    pub measures: MeasureMap,
    /// Number of sub-queries feeding the cursor.
    pub union_group_count: u32,
}

impl AdapterContext {
    /// Context for a cursor fed by a single sub-query.
    pub fn new(grid: BucketGrid, measures: MeasureMap) -> Self {
        Self {
            grid,
            measures,
            union_group_count: 1,
        }
    }

    /// Sets the number of sub-queries.
    #[must_use]
    pub fn with_union_groups(mut self, union_group_count: u32) -> Self {
        self.union_group_count = union_group_count.max(1);
        self
    }

    /// A fresh guard for this context.
    pub fn guard(&self) -> OrderingGuard {
        OrderingGuard::new(&self.grid, self.union_group_count)
    }

    /// Bucket index of `timestamp` in the grid.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Protocol`] if the timestamp is outside the grid.
    pub fn bucket_of(&self, timestamp: i64) -> Result<u32> {
        self.grid.bucket_of(timestamp).ok_or_else(|| {
            AdapterError::protocol(format!(
                "timestamp {timestamp} is outside the query range {}",
                self.grid.range()
            ))
            .into()
        })
    }
}

/// Checks that a tuple stream is ordered the way the merge engine needs.
///
/// Union groups must be non-decreasing, bucket keys non-decreasing inside a
/// union group, keys below the bucket count and groups below the group count.
#[derive(Debug, Clone)]
pub struct OrderingGuard {
    bucket_count: u32,
    union_group_count: u32,
    last: Option<(u32, u32)>,
}

impl OrderingGuard {
    /// Creates a guard for `grid` and `union_group_count` sub-queries.
    pub fn new(grid: &BucketGrid, union_group_count: u32) -> Self {
        Self {
            bucket_count: grid.bucket_count(),
            union_group_count,
            last: None,
        }
    }

    /// Validates the next tuple.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Protocol`] describing the first violation.
    pub fn check(&mut self, tuple: &RawTuple) -> Result<()> {
        let current = (tuple.union_group, tuple.bucket_key);

        if tuple.bucket_key >= self.bucket_count {
            return Err(AdapterError::protocol(format!(
                "bucket key {} is outside the grid of {} buckets",
                tuple.bucket_key, self.bucket_count
            ))
            .into());
        }
        if tuple.union_group >= self.union_group_count {
            return Err(AdapterError::protocol(format!(
                "union group {} exceeds the declared {} groups",
                tuple.union_group, self.union_group_count
            ))
            .into());
        }
        if let Some(last) = self.last
            && current < last
        {
            return Err(AdapterError::protocol(format!(
                "cursor went backwards: (group {}, bucket {}) after (group {}, bucket {})",
                current.0, current.1, last.0, last.1
            ))
            .into());
        }

        self.last = Some(current);
        Ok(())
    }
}

/// The adapter for one query, selected by backend kind.
pub enum BackendAdapter<'a> {
    /// Rows from a relational cursor.
    Relational(RelationalAdapter<'a>),
    /// Per-role result tables from a time-series engine.
    TimeSeriesTable(TableAdapter),
    /// Record batches from an Arrow stream.
    ArrowStream(ArrowAdapter<'a>),
    /// Raw records scanned from a flat file.
    Records(RecordTuples<'a>),
}

impl fmt::Debug for BackendAdapter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Relational(_) => "Relational",
            Self::TimeSeriesTable(_) => "TimeSeriesTable",
            Self::ArrowStream(_) => "ArrowStream",
            Self::Records(_) => "Records",
        };
        f.debug_tuple("BackendAdapter").field(&kind).finish()
    }
}

impl Iterator for BackendAdapter<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Relational(a) => a.next(),
            Self::TimeSeriesTable(a) => a.next(),
            Self::ArrowStream(a) => a.next(),
            Self::Records(a) => a.next(),
        }
    }
}

impl<'a> From<RelationalAdapter<'a>> for BackendAdapter<'a> {
    fn from(adapter: RelationalAdapter<'a>) -> Self {
        Self::Relational(adapter)
    }
}

impl From<TableAdapter> for BackendAdapter<'_> {
    fn from(adapter: TableAdapter) -> Self {
        Self::TimeSeriesTable(adapter)
    }
}

impl<'a> From<ArrowAdapter<'a>> for BackendAdapter<'a> {
    fn from(adapter: ArrowAdapter<'a>) -> Self {
        Self::ArrowStream(adapter)
    }
}

impl<'a> From<RecordTuples<'a>> for BackendAdapter<'a> {
    fn from(adapter: RecordTuples<'a>) -> Self {
        Self::Records(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::TimeRange;

    fn grid() -> BucketGrid {
        BucketGrid::new(TimeRange::new(0, 1_000).unwrap(), 10).unwrap()
    }

    fn tuple(union_group: u32, bucket_key: u32) -> RawTuple {
        RawTuple {
            union_group,
            bucket_key,
            measure: MeasureId(0),
            role: Role::Raw,
            timestamp: None,
            value: Some(1.0),
        }
    }

    #[test]
    fn test_measure_map() {
        let map = MeasureMap::new(["cpu", "mem"]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.id_of("mem"), Some(MeasureId(1)));
        assert_eq!(map.name_of(MeasureId(0)), Some("cpu"));
        assert!(map.contains(MeasureId(1)));
        assert!(!map.contains(MeasureId(2)));
        assert!(map.resolve("disk").is_err());
        assert_eq!(map.ids(), vec![MeasureId(0), MeasureId(1)]);

        assert!(MeasureMap::new(["cpu", "cpu"]).is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("MIN".parse::<Role>().unwrap(), Role::Min);
        assert_eq!(" last ".parse::<Role>().unwrap(), Role::Last);
        assert!("median".parse::<Role>().is_err());
    }

    #[test]
    fn test_guard_accepts_ordered_stream() {
        let mut guard = OrderingGuard::new(&grid(), 2);
        for (g, k) in [(0, 0), (0, 0), (0, 3), (1, 0), (1, 9)] {
            guard.check(&tuple(g, k)).unwrap();
        }
    }

    #[test]
    fn test_guard_rejects_violations() {
        let mut guard = OrderingGuard::new(&grid(), 2);
        guard.check(&tuple(0, 5)).unwrap();
        assert!(guard.check(&tuple(0, 4)).is_err());

        let mut guard = OrderingGuard::new(&grid(), 2);
        guard.check(&tuple(1, 0)).unwrap();
        assert!(guard.check(&tuple(0, 9)).is_err());

        let mut guard = OrderingGuard::new(&grid(), 2);
        assert!(guard.check(&tuple(0, 10)).is_err());
        assert!(guard.check(&tuple(2, 0)).is_err());
    }
}
