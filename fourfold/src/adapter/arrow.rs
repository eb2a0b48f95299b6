//! Adapter for Arrow record batch streams.
//!
//! A record batch carries no semantic binding of column to measure beyond the
//! column name, so measure columns are found by looking their names up in the
//! query's [`MeasureMap`](super::MeasureMap). The remaining structural columns
//! (time, bucket, union group, role) are named by an [`ArrowBinding`].
//!
//! Batches are decoded column by column into a queue of tuples in row order.

use std::collections::VecDeque;

use ::arrow::array::{Array, ArrayRef, AsArray};
use ::arrow::compute::cast;
use ::arrow::datatypes::{DataType, Float64Type, Int64Type, TimeUnit};
use ::arrow::error::ArrowError;
use ::arrow::record_batch::RecordBatch;

use super::{AdapterContext, MeasureId, OrderingGuard, RawTuple, Role};
use crate::error::{AdapterError, FourfoldError, Result};

/// Names of the structural columns of a record batch stream.
///
/// At least one of `time_column` and `bucket_column` must be present in every
/// batch. Without a role column every value is a [`Role::Raw`] sample; without
/// a union group column every row belongs to group 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrowBinding {
    /// Column holding timestamps.
    pub time_column: Option<String>,
    /// Column holding precomputed bucket indices.
    pub bucket_column: Option<String>,
    /// Column holding union group ids.
    pub union_group_column: Option<String>,
    /// Column holding role names (`min`, `max`, `first`, `last`, `raw`).
    pub role_column: Option<String>,
}

impl ArrowBinding {
    /// A binding for raw samples keyed by a time column.
    pub fn raw(time_column: impl Into<String>) -> Self {
        Self {
            time_column: Some(time_column.into()),
            ..Self::default()
        }
    }

    /// Sets the bucket column.
    #[must_use]
    pub fn with_bucket_column(mut self, name: impl Into<String>) -> Self {
        self.bucket_column = Some(name.into());
        self
    }

    /// Sets the union group column.
    #[must_use]
    pub fn with_union_group_column(mut self, name: impl Into<String>) -> Self {
        self.union_group_column = Some(name.into());
        self
    }

    /// Sets the role column.
    #[must_use]
    pub fn with_role_column(mut self, name: impl Into<String>) -> Self {
        self.role_column = Some(name.into());
        self
    }

    fn is_structural(&self, name: &str) -> bool {
        [
            &self.time_column,
            &self.bucket_column,
            &self.union_group_column,
            &self.role_column,
        ]
        .into_iter()
        .any(|c| c.as_deref() == Some(name))
    }
}

/// Decodes a timestamp-like column into epoch milliseconds.
///
/// Integer and `Date64` columns are taken as milliseconds; `Timestamp`
/// columns are scaled from their unit.
///
/// # Errors
///
/// Returns [`ArrowError::CastError`] for columns that are not timestamp-like.
pub fn timestamp_millis(column: &ArrayRef) -> std::result::Result<Vec<Option<i64>>, ArrowError> {
    let unit = match column.data_type() {
        DataType::Timestamp(unit, _) => *unit,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Date64 => TimeUnit::Millisecond,
        other => {
            return Err(ArrowError::CastError(format!(
                "cannot read {other} as a timestamp"
            )));
        }
    };

    let raw = integers(column)?;
    Ok(raw
        .into_iter()
        .map(|v| {
            v.map(|raw| match unit {
                TimeUnit::Second => raw.saturating_mul(1_000),
                TimeUnit::Millisecond => raw,
                TimeUnit::Microsecond => raw.div_euclid(1_000),
                TimeUnit::Nanosecond => raw.div_euclid(1_000_000),
            })
        })
        .collect())
}

/// Casts a column to `Int64` values.
///
/// # Errors
///
/// Returns an error if the column cannot be cast.
pub fn integers(column: &ArrayRef) -> std::result::Result<Vec<Option<i64>>, ArrowError> {
    let converted = cast(column, &DataType::Int64)?;
    let ints = converted
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| ArrowError::CastError("cast to Int64 did not yield Int64".to_string()))?;
    Ok(ints.iter().collect())
}

/// Casts a column to `Float64` values.
///
/// # Errors
///
/// Returns an error if the column cannot be cast.
pub fn floats(column: &ArrayRef) -> std::result::Result<Vec<Option<f64>>, ArrowError> {
    let converted = cast(column, &DataType::Float64)?;
    let values = converted
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| ArrowError::CastError("cast to Float64 did not yield Float64".to_string()))?;
    Ok(values.iter().collect())
}

/// Reads a string column.
///
/// # Errors
///
/// Returns an [`ArrowError`] if the column cannot be cast to text.
pub fn strings(column: &ArrayRef) -> std::result::Result<Vec<Option<String>>, ArrowError> {
    let converted = cast(column, &DataType::Utf8)?;
    let values = converted
        .as_string_opt::<i32>()
        .ok_or_else(|| ArrowError::CastError("cast to Utf8 did not yield Utf8".to_string()))?;
    Ok(values.iter().map(|v| v.map(str::to_string)).collect())
}

fn arrow_error(source: ArrowError) -> FourfoldError {
    AdapterError::Arrow { source }.into()
}

/// Turns a record batch stream into raw tuples.
pub struct ArrowAdapter<'a> {
    batches: Box<dyn Iterator<Item = std::result::Result<RecordBatch, ArrowError>> + 'a>,
    binding: ArrowBinding,
    context: AdapterContext,
    guard: OrderingGuard,
    pending: VecDeque<RawTuple>,
    batches_read: u64,
    done: bool,
}

impl std::fmt::Debug for ArrowAdapter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrowAdapter")
            .field("binding", &self.binding)
            .field("pending", &self.pending.len())
            .field("batches_read", &self.batches_read)
            .finish_non_exhaustive()
    }
}

impl<'a> ArrowAdapter<'a> {
    /// Wraps a batch stream.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Protocol`] if the binding names neither a time
    /// nor a bucket column.
    pub fn new<I>(batches: I, binding: ArrowBinding, context: AdapterContext) -> Result<Self>
    where
        I: IntoIterator<Item = std::result::Result<RecordBatch, ArrowError>>,
        I::IntoIter: 'a,
    {
        if binding.time_column.is_none() && binding.bucket_column.is_none() {
            return Err(AdapterError::protocol(
                "arrow binding needs a time column or a bucket column",
            )
            .into());
        }
        let guard = context.guard();
        Ok(Self {
            batches: Box::new(batches.into_iter()),
            binding,
            context,
            guard,
            pending: VecDeque::new(),
            batches_read: 0,
            done: false,
        })
    }

    /// Number of batches decoded so far.
    pub fn batches_read(&self) -> u64 {
        self.batches_read
    }

    fn decode(&mut self, batch: &RecordBatch) -> Result<()> {
        let rows = batch.num_rows();

        let times = named_column(batch, self.binding.time_column.as_ref())?
            .map(timestamp_millis)
            .transpose()
            .map_err(arrow_error)?;
        let buckets = named_column(batch, self.binding.bucket_column.as_ref())?
            .map(integers)
            .transpose()
            .map_err(arrow_error)?;
        let groups = named_column(batch, self.binding.union_group_column.as_ref())?
            .map(integers)
            .transpose()
            .map_err(arrow_error)?;
        let roles = named_column(batch, self.binding.role_column.as_ref())?
            .map(strings)
            .transpose()
            .map_err(arrow_error)?;

        let schema = batch.schema();
        let mut measures: Vec<(MeasureId, Vec<Option<f64>>)> = Vec::new();
        for (field, column) in schema.fields().iter().zip(batch.columns()) {
            if self.binding.is_structural(field.name()) {
                continue;
            }
            if let Some(id) = self.context.measures.id_of(field.name()) {
                measures.push((id, floats(column).map_err(arrow_error)?));
            }
        }

        for row in 0..rows {
            let timestamp = times.as_ref().and_then(|t| t[row]);
            let bucket_key = match &buckets {
                Some(keys) => index_value("bucket", keys[row], row)?,
                None => {
                    let Some(t) = timestamp else {
                        return Err(AdapterError::protocol(format!(
                            "row {row} has a null timestamp and no bucket"
                        ))
                        .into());
                    };
                    self.context.bucket_of(t)?
                }
            };
            let union_group = match &groups {
                Some(ids) => index_value("union group", ids[row], row)?,
                None => 0,
            };
            let role = match &roles {
                Some(names) => names[row]
                    .as_deref()
                    .ok_or_else(|| AdapterError::protocol(format!("row {row} has a null role")))?
                    .parse::<Role>()?,
                None => Role::Raw,
            };

            for (measure, values) in &measures {
                let Some(value) = values[row] else {
                    continue;
                };
                let tuple = RawTuple {
                    union_group,
                    bucket_key,
                    measure: *measure,
                    role,
                    timestamp: timestamp.filter(|_| role.is_temporal()),
                    value: Some(value),
                };
                self.guard.check(&tuple)?;
                self.pending.push_back(tuple);
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<RawTuple>> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Ok(Some(tuple));
            }
            let Some(batch) = self.batches.next() else {
                return Ok(None);
            };
            let batch = batch.map_err(arrow_error)?;
            self.batches_read += 1;
            self.decode(&batch)?;
        }
    }
}

fn named_column<'b>(batch: &'b RecordBatch, name: Option<&String>) -> Result<Option<&'b ArrayRef>> {
    let Some(name) = name else {
        return Ok(None);
    };
    batch.column_by_name(name).map(Some).ok_or_else(|| {
        AdapterError::protocol(format!("record batch has no column '{name}'")).into()
    })
}

fn index_value(what: &str, value: Option<i64>, row: usize) -> Result<u32> {
    let value =
        value.ok_or_else(|| AdapterError::protocol(format!("row {row} has a null {what}")))?;
    u32::try_from(value).map_err(|_| {
        AdapterError::protocol(format!("row {row} has an invalid {what} {value}")).into()
    })
}

impl Iterator for ArrowAdapter<'_> {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MeasureMap;
    use crate::range::{BucketGrid, TimeRange};
    use ::arrow::array::{Float64Array, Int32Array, Int64Array, StringArray, TimestampSecondArray, UInt32Array};
    use ::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn context() -> AdapterContext {
        let grid = BucketGrid::new(TimeRange::new(0, 10_000).unwrap(), 10).unwrap();
        AdapterContext::new(grid, MeasureMap::new(["cpu", "mem"]).unwrap()).with_union_groups(2)
    }

    fn raw_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("mem", DataType::Int32, true),
            Field::new("time", DataType::Int64, false),
            Field::new("cpu", DataType::Float64, true),
            Field::new("host", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(10), None, Some(30)])),
                Arc::new(Int64Array::from(vec![500, 1_500, 1_600])),
                Arc::new(Float64Array::from(vec![0.5, 0.6, 0.7])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_raw_samples_bucketed_by_time() {
        let adapter =
            ArrowAdapter::new(vec![Ok(raw_batch())], ArrowBinding::raw("time"), context()).unwrap();
        let tuples: Vec<RawTuple> = adapter.collect::<Result<_>>().unwrap();

        // Row 1 has a null mem, so five observations.
        assert_eq!(tuples.len(), 5);
        assert_eq!(tuples[0].measure, MeasureId(1));
        assert_eq!(tuples[0].value, Some(10.0));
        assert_eq!(tuples[1].measure, MeasureId(0));
        assert_eq!(tuples[2].bucket_key, 1);
        assert!(tuples.iter().all(|t| t.role == Role::Raw));
        assert_eq!(tuples[4].timestamp, Some(1_600));
    }

    #[test]
    fn test_structural_columns() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("bucket", DataType::UInt32, false),
            Field::new("ug", DataType::Int64, false),
            Field::new("role", DataType::Utf8, false),
            Field::new("ts", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("cpu", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt32Array::from(vec![3, 3, 3])),
                Arc::new(Int64Array::from(vec![0, 0, 1])),
                Arc::new(StringArray::from(vec!["first", "min", "first"])),
                Arc::new(TimestampSecondArray::from(vec![3, 3, 4])),
                Arc::new(Float64Array::from(vec![1.0, 0.5, 2.0])),
            ],
        )
        .unwrap();

        let binding = ArrowBinding::raw("ts")
            .with_bucket_column("bucket")
            .with_union_group_column("ug")
            .with_role_column("role");
        let mut adapter = ArrowAdapter::new(vec![Ok(batch)], binding, context()).unwrap();
        let tuples: Vec<RawTuple> = adapter.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(tuples.len(), 3);
        assert_eq!((tuples[0].role, tuples[0].timestamp), (Role::First, Some(3_000)));
        assert_eq!((tuples[1].role, tuples[1].timestamp), (Role::Min, None));
        assert_eq!((tuples[2].union_group, tuples[2].bucket_key), (1, 3));
        assert_eq!(adapter.batches_read(), 1);
    }

    #[test]
    fn test_binding_requires_time_or_bucket() {
        let result = ArrowAdapter::new(Vec::new(), ArrowBinding::default(), context());
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_column_is_protocol_error() {
        let adapter =
            ArrowAdapter::new(vec![Ok(raw_batch())], ArrowBinding::raw("timestamp"), context())
                .unwrap();
        let results: Vec<Result<RawTuple>> = adapter.collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FourfoldError::Adapter(AdapterError::Protocol { .. }))
        ));
    }

    #[test]
    fn test_stream_error_surfaces() {
        let batches = vec![
            Ok(raw_batch()),
            Err(ArrowError::IoError("connection reset".to_string(), std::io::Error::other("reset"))),
        ];
        let results: Vec<Result<RawTuple>> =
            ArrowAdapter::new(batches, ArrowBinding::raw("time"), context())
                .unwrap()
                .collect();
        assert_eq!(results.len(), 6);
        assert!(matches!(
            results[5],
            Err(FourfoldError::Adapter(AdapterError::Arrow { .. }))
        ));
    }

    #[test]
    fn test_timestamp_units() {
        let column: ArrayRef = Arc::new(TimestampSecondArray::from(vec![Some(2), None]));
        assert_eq!(timestamp_millis(&column).unwrap(), vec![Some(2_000), None]);

        let column: ArrayRef = Arc::new(StringArray::from(vec!["x"]));
        assert!(timestamp_millis(&column).is_err());
    }
}
