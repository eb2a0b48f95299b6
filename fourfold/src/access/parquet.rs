//! Partition-addressed random access into Parquet files.
//!
//! Row groups are the partitions. The layout estimates a partition from the
//! timestamp, then the source steps one partition at a time until the target
//! lies between this partition's first timestamp and the next one's. Inside
//! the partition the record is found by binary search over the decoded time
//! column. Offsets are global row ordinals.
//!
//! Row-group statistics give each partition's first timestamp without
//! decoding, when the time column is stored as milliseconds. Other encodings
//! fall back to decoding the time column of the partition.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use ::arrow::array::ArrayRef;
use ::arrow::datatypes::{DataType, TimeUnit};
use ::arrow::error::ArrowError;
use ::arrow::record_batch::RecordBatch;
use ::parquet::arrow::ProjectionMask;
use ::parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
};
use ::parquet::errors::ParquetError;
use ::parquet::file::statistics::Statistics;
use tracing::{debug, trace};

use super::{RangeScan, RawRecord, RecordLocation, TimeIndexed, check_bounds, check_measures};
use crate::adapter::arrow::{floats, strings, timestamp_millis};
use crate::adapter::{MeasureId, MeasureMap};
use crate::config::{DatasetConfig, TimeFormat};
use crate::error::{AccessError, FourfoldError, Result};
use crate::layout::{Addressing, Estimate, SampledLayout};
use crate::range::TimeRange;

/// A non-empty row group.
#[derive(Debug, Clone, Copy)]
struct Partition {
    group: usize,
    first_row: u64,
    rows: u64,
    min_time: Option<i64>,
}

/// A Parquet file opened for time-indexed access.
#[derive(Debug)]
pub struct ParquetSource {
    file: File,
    label: String,
    metadata: ArrowReaderMetadata,
    time_format: TimeFormat,
    time_column: String,
    columns: Vec<String>,
    measures: MeasureMap,
    partitions: Vec<Partition>,
    cached: Option<(usize, Arc<Vec<i64>>)>,
    layout: SampledLayout,
    correction_steps: u64,
}

impl ParquetSource {
    /// Opens the file, reads its metadata and samples its layout.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] or [`AccessError::Parquet`] if the file
    /// cannot be read, [`AccessError::EmptySource`] if it holds no rows and
    /// [`AccessError::UnknownColumn`] if a configured column is missing.
    pub fn open(config: &DatasetConfig) -> Result<Self> {
        let label = config.path.display().to_string();
        let file = File::open(&config.path).map_err(|source| AccessError::Io {
            path: label.clone(),
            source,
        })?;
        let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::default())
            .map_err(|source| AccessError::Parquet {
                path: label.clone(),
                source,
            })?;

        let schema = metadata.schema().clone();
        let unknown = |column: &str| -> FourfoldError {
            AccessError::UnknownColumn {
                path: label.clone(),
                column: column.to_string(),
            }
            .into()
        };

        let time_column = match &config.time_column {
            Some(name) => name.clone(),
            None => schema
                .fields()
                .first()
                .map(|f| f.name().clone())
                .ok_or_else(|| unknown("<first column>"))?,
        };
        let time_index = schema
            .index_of(&time_column)
            .map_err(|_| unknown(&time_column))?;
        for name in &config.measures {
            schema.index_of(name).map_err(|_| unknown(name))?;
        }

        let stats_are_millis = matches!(
            schema.field(time_index).data_type(),
            DataType::Int64 | DataType::Timestamp(TimeUnit::Millisecond, _)
        );

        let mut partitions = Vec::new();
        let mut first_row = 0u64;
        for (group, meta) in metadata.metadata().row_groups().iter().enumerate() {
            let rows = u64::try_from(meta.num_rows()).unwrap_or(0);
            if rows > 0 {
                let min_time = if stats_are_millis {
                    meta.columns()
                        .get(time_index)
                        .and_then(|c| c.statistics())
                        .and_then(|s| match s {
                            Statistics::Int64(v) => v.min_opt().copied(),
                            _ => None,
                        })
                } else {
                    None
                };
                partitions.push(Partition {
                    group,
                    first_row,
                    rows,
                    min_time,
                });
            }
            first_row += rows;
        }

        let mut source = Self {
            file,
            label,
            metadata,
            time_format: config.time_format.clone(),
            time_column,
            columns: config.measures.clone(),
            measures: MeasureMap::new(config.measures.iter().cloned())?,
            partitions,
            cached: None,
            layout: SampledLayout::default(),
            correction_steps: 0,
        };
        source.layout = source.sample(first_row)?;
        Ok(source)
    }

    /// Replaces the sampled layout.
    ///
    /// Lookups stay exact for any initialized layout; a poor one only costs
    /// correction steps.
    pub fn set_layout(&mut self, layout: SampledLayout) {
        self.layout = layout;
    }

    /// Total correction steps taken by lookups so far.
    pub fn correction_steps(&self) -> u64 {
        self.correction_steps
    }

    /// Number of non-empty row groups.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn sample(&mut self, total_rows: u64) -> Result<SampledLayout> {
        let Some(records_per_partition) = self.partitions.first().map(|p| p.rows) else {
            return Err(AccessError::EmptySource {
                path: self.label.clone(),
            }
            .into());
        };
        let last_index = self.partitions.len() - 1;

        let start_time = self.first_time(0)?;
        let end_time = self
            .group_times(last_index)?
            .last()
            .copied()
            .ok_or_else(|| self.corrupt(total_rows.saturating_sub(1), "empty row group".into()))?;

        let sampling_interval = if total_rows > 1 {
            let steps = i64::try_from(total_rows - 1).unwrap_or(i64::MAX);
            (end_time.saturating_sub(start_time) / steps).max(1)
        } else {
            1
        };

        let layout = SampledLayout {
            start_time,
            end_time,
            sampling_interval,
            record_count_hint: total_rows,
            addressing: Addressing::Partitions {
                records_per_partition,
                partition_count: self.partitions.len(),
            },
        };
        debug!(
            source = %self.label,
            start = start_time,
            end = end_time,
            interval = sampling_interval,
            partitions = self.partitions.len(),
            "sampled parquet layout"
        );
        Ok(layout)
    }

    fn corrupt(&self, offset: u64, reason: String) -> FourfoldError {
        AccessError::CorruptRecord {
            path: self.label.clone(),
            offset,
            reason,
        }
        .into()
    }

    fn parquet_error(&self, source: ParquetError) -> FourfoldError {
        AccessError::Parquet {
            path: self.label.clone(),
            source,
        }
        .into()
    }

    fn arrow_error(&self, source: ArrowError) -> FourfoldError {
        AccessError::Arrow {
            path: self.label.clone(),
            source,
        }
        .into()
    }

    /// Reads `columns` of one row group.
    fn read_group(&self, partition: usize, columns: &[&str]) -> Result<Vec<RecordBatch>> {
        let group = self.partitions[partition].group;
        let file = self.file.try_clone().map_err(|source| AccessError::Io {
            path: self.label.clone(),
            source,
        })?;

        let builder = ParquetRecordBatchReaderBuilder::new_with_metadata(file, self.metadata.clone());
        let mask = ProjectionMask::columns(builder.parquet_schema(), columns.iter().copied());
        let reader = builder
            .with_row_groups(vec![group])
            .with_projection(mask)
            .build()
            .map_err(|e| self.parquet_error(e))?;

        trace!(source = %self.label, group, "decoding row group");
        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.arrow_error(e))
    }

    fn decode_times(&self, column: &ArrayRef, first_row: u64) -> Result<Vec<i64>> {
        let values = match column.data_type() {
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
                let texts = strings(column).map_err(|e| self.arrow_error(e))?;
                texts
                    .into_iter()
                    .map(|t| t.and_then(|t| self.time_format.parse(&t)))
                    .collect::<Vec<_>>()
            }
            _ => timestamp_millis(column).map_err(|e| self.arrow_error(e))?,
        };

        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    self.corrupt(first_row + i as u64, "null or unparsable timestamp".into())
                })
            })
            .collect()
    }

    /// Decoded time column of one partition, cached for the latest partition.
    fn group_times(&mut self, partition: usize) -> Result<Arc<Vec<i64>>> {
        if let Some((cached, times)) = &self.cached
            && *cached == partition
        {
            return Ok(Arc::clone(times));
        }

        let batches = self.read_group(partition, &[self.time_column.as_str()])?;
        let mut row = self.partitions[partition].first_row;
        let mut times = Vec::new();
        for batch in &batches {
            let column = batch
                .column_by_name(&self.time_column)
                .ok_or_else(|| self.corrupt(row, "time column missing from batch".into()))?;
            times.extend(self.decode_times(column, row)?);
            row += batch.num_rows() as u64;
        }

        let times = Arc::new(times);
        self.cached = Some((partition, Arc::clone(&times)));
        Ok(times)
    }

    fn first_time(&mut self, partition: usize) -> Result<i64> {
        if let Some(min) = self.partitions[partition].min_time {
            return Ok(min);
        }
        let first_row = self.partitions[partition].first_row;
        self.group_times(partition)?
            .first()
            .copied()
            .ok_or_else(|| self.corrupt(first_row, "empty row group".into()))
    }

    fn partition_of_row(&self, row: u64) -> usize {
        self.partitions
            .partition_point(|p| p.first_row + p.rows <= row)
            .min(self.partitions.len().saturating_sub(1))
    }
}

impl TimeIndexed for ParquetSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn layout(&self) -> &SampledLayout {
        &self.layout
    }

    fn measures(&self) -> &MeasureMap {
        &self.measures
    }

    fn locate_record(&mut self, timestamp: i64) -> Result<RecordLocation> {
        self.layout.ensure_initialized(&self.label)?;
        check_bounds(&self.layout, timestamp)?;

        let last = self.partitions.len().saturating_sub(1);
        let mut partition = match self.layout.estimate(timestamp) {
            Estimate::Partition(p) => p.min(last),
            Estimate::Byte(_) => 0,
        };

        let mut steps = 0u64;
        loop {
            if self.first_time(partition)? > timestamp {
                if partition == 0 {
                    return Err(AccessError::OutOfRange {
                        timestamp,
                        start: self.layout.start_time,
                        end: self.layout.end_time,
                    }
                    .into());
                }
                partition -= 1;
                steps += 1;
                continue;
            }
            if partition < last && self.first_time(partition + 1)? <= timestamp {
                partition += 1;
                steps += 1;
                continue;
            }
            break;
        }

        let times = self.group_times(partition)?;
        let index = times.partition_point(|&t| t <= timestamp).saturating_sub(1);
        let offset = self.partitions[partition].first_row + index as u64;

        self.correction_steps += steps;
        debug!(source = %self.label, timestamp, partition, offset, steps, "located row");
        Ok(RecordLocation {
            offset,
            timestamp: times[index],
        })
    }

    fn scan(&mut self, range: TimeRange, measures: &[MeasureId]) -> Result<RangeScan<'_>> {
        check_measures(&self.measures, measures)?;
        let range = self.clamp(range)?;

        let (lower, upper) = if range.is_empty() {
            (1, 0)
        } else {
            // Duplicates of `from` precede the located row; anchor one row earlier.
            let lower = if range.from() > self.layout.start_time {
                self.locate_record(range.from() - 1)?.offset
            } else {
                0
            };
            let upper = self.locate_record(range.to() - 1)?.offset;
            (lower, upper)
        };
        let next_partition = self.partition_of_row(lower);

        Ok(RangeScan::Parquet(ParquetScan {
            source: self,
            range,
            measures: measures.to_vec(),
            lower,
            upper,
            next_partition,
            pending: VecDeque::new(),
            last_timestamp: None,
            done: range.is_empty(),
        }))
    }
}

/// Forward scan over the rows of a Parquet range, one row group at a time.
#[derive(Debug)]
pub struct ParquetScan<'a> {
    source: &'a mut ParquetSource,
    range: TimeRange,
    measures: Vec<MeasureId>,
    lower: u64,
    upper: u64,
    next_partition: usize,
    pending: VecDeque<RawRecord>,
    last_timestamp: Option<i64>,
    done: bool,
}

impl ParquetScan<'_> {
    /// The clamped range being scanned.
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Measures projected into `fields[1..]`.
    pub fn measures(&self) -> &[MeasureId] {
        &self.measures
    }

    /// Name of the scanned file.
    pub fn label(&self) -> &str {
        &self.source.label
    }

    fn load_partition(&mut self, partition: usize) -> Result<()> {
        let source = &*self.source;
        let names: Vec<&str> = self
            .measures
            .iter()
            .map(|m| source.columns[m.0 as usize].as_str())
            .collect();
        let mut projection = names.clone();
        projection.push(source.time_column.as_str());

        let batches = source.read_group(partition, &projection)?;
        let mut row = source.partitions[partition].first_row;
        for batch in &batches {
            let time_column = batch
                .column_by_name(&source.time_column)
                .ok_or_else(|| source.corrupt(row, "time column missing from batch".into()))?;
            let times = source.decode_times(time_column, row)?;

            let mut values = Vec::with_capacity(names.len());
            for name in &names {
                let column = batch
                    .column_by_name(name)
                    .ok_or_else(|| source.corrupt(row, format!("column '{name}' missing from batch")))?;
                values.push(floats(column).map_err(|e| source.arrow_error(e))?);
            }

            for (i, timestamp) in times.into_iter().enumerate() {
                let ordinal = row + i as u64;
                if ordinal < self.lower || ordinal > self.upper || timestamp < self.range.from() {
                    continue;
                }
                if self.last_timestamp.is_some_and(|last| timestamp < last) {
                    return Err(source.corrupt(
                        ordinal,
                        format!("timestamp {timestamp} is out of order"),
                    ));
                }
                self.last_timestamp = Some(timestamp);
                if timestamp >= self.range.to() {
                    continue;
                }
                let mut fields = Vec::with_capacity(names.len() + 1);
                fields.push(timestamp.to_string());
                fields.extend(
                    values
                        .iter()
                        .map(|column| column[i].map(|v| v.to_string()).unwrap_or_default()),
                );
                self.pending.push_back(RawRecord {
                    offset: ordinal,
                    timestamp,
                    fields,
                });
            }
            row += batch.num_rows() as u64;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            let partition = self.next_partition;
            if partition >= self.source.partitions.len()
                || self.source.partitions[partition].first_row > self.upper
            {
                return Ok(None);
            }
            self.next_partition += 1;
            self.load_partition(partition)?;
        }
    }
}

impl Iterator for ParquetScan<'_> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
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
