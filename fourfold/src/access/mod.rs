//! Time-indexed random access into flat files.
//!
//! Flat files have no query engine and no index. A [`TimeIndexed`] source
//! answers "where is timestamp `t`?" by interpolation search: the
//! [`SampledLayout`] estimates a position, then the source corrects the
//! estimate one record at a time in the indicated direction until it finds the
//! record `r` with `r.timestamp <= t < next(r).timestamp`.
//!
//! Because every correction step is a single record, the answer is exact no
//! matter how far off the estimate was; a bad estimate only costs extra steps.
//! Files must be sorted by time. An unsorted file is outside the contract.
//!
//! Two sources exist, selected through [`FileSource`]:
//!
//! - [`CsvSource`](csv::CsvSource): byte-addressed, offsets are byte offsets
//!   of record lines;
//! - [`ParquetSource`](parquet::ParquetSource): partition-addressed by row
//!   group, offsets are row ordinals.
//!
//! Range scans use half-open `[from, to)` bounds. A range that overshoots the
//! file is clamped to it; a range entirely outside is
//! [`AccessError::OutOfRange`].

pub mod csv;
pub mod parquet;

use tracing::debug;

use crate::adapter::{MeasureId, MeasureMap};
use crate::config::{DatasetConfig, FileFormat};
use crate::error::{AccessError, AdapterError, Result};
use crate::layout::SampledLayout;
use crate::range::TimeRange;

pub use self::csv::{CsvScan, CsvSource};
pub use self::parquet::{ParquetScan, ParquetSource};

/// One record materialized from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Byte offset (CSV) or row ordinal (Parquet) of the record.
    pub offset: u64,
    /// Parsed timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Time field text followed by the requested measures in requested order.
    /// Missing values are empty strings.
    pub fields: Vec<String>,
}

/// Where a located record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Byte offset (CSV) or row ordinal (Parquet).
    pub offset: u64,
    /// Timestamp of the record.
    pub timestamp: i64,
}

/// Random access by timestamp.
pub trait TimeIndexed {
    /// Name of the source used in errors and logs.
    fn label(&self) -> &str;

    /// The sampled layout.
    fn layout(&self) -> &SampledLayout;

    /// The measures this source can serve.
    fn measures(&self) -> &MeasureMap;

    /// Finds the record `r` with `r.timestamp <= t < next(r).timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::UninitializedLayout`] if the layout is not
    /// usable, [`AccessError::OutOfRange`] if `t` lies outside the file and
    /// [`AccessError::CorruptRecord`] if a record on the path cannot be parsed.
    fn locate_record(&mut self, timestamp: i64) -> Result<RecordLocation>;

    /// Offset of the record holding `timestamp`.
    ///
    /// # Errors
    ///
    /// See [`TimeIndexed::locate_record`].
    fn locate(&mut self, timestamp: i64) -> Result<u64> {
        Ok(self.locate_record(timestamp)?.offset)
    }

    /// Clamps `range` to the time span of the file.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::OutOfRange`] if the range does not overlap the
    /// file at all.
    fn clamp(&self, range: TimeRange) -> Result<TimeRange> {
        clamp_to_layout(self.label(), self.layout(), range)
    }

    /// Lazily scans records in `range` (clamped), projecting `measures`.
    ///
    /// # Errors
    ///
    /// Fails like [`TimeIndexed::locate_record`] while positioning, and with
    /// [`AdapterError::UnknownMeasure`] for measures the source does not map.
    fn scan(&mut self, range: TimeRange, measures: &[MeasureId]) -> Result<RangeScan<'_>>;

    /// Collects a scan into memory.
    ///
    /// # Errors
    ///
    /// Fails like [`TimeIndexed::scan`]; a corrupt record aborts the whole
    /// materialization.
    fn materialize(&mut self, range: TimeRange, measures: &[MeasureId]) -> Result<Vec<RawRecord>> {
        self.scan(range, measures)?.collect()
    }
}

/// Clamps `range` to the inclusive bounds of `layout`, as half-open range.
///
/// # Errors
///
/// Returns [`AccessError::OutOfRange`] if `range` is disjoint from the file.
pub fn clamp_to_layout(label: &str, layout: &SampledLayout, range: TimeRange) -> Result<TimeRange> {
    layout.ensure_initialized(label)?;
    let (start, end) = layout.time_bounds();

    if range.to() <= start || range.from() > end {
        let timestamp = if range.from() > end {
            range.from()
        } else {
            range.to()
        };
        return Err(AccessError::OutOfRange {
            timestamp,
            start,
            end,
        }
        .into());
    }

    let clamped = TimeRange::new(range.from().max(start), range.to().min(end.saturating_add(1)))?;
    if clamped != range {
        debug!(source = label, requested = %range, clamped = %clamped, "clamped scan range");
    }
    Ok(clamped)
}

pub(crate) fn check_bounds(layout: &SampledLayout, timestamp: i64) -> Result<()> {
    let (start, end) = layout.time_bounds();
    if timestamp < start || timestamp > end {
        return Err(AccessError::OutOfRange {
            timestamp,
            start,
            end,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn check_measures(map: &MeasureMap, measures: &[MeasureId]) -> Result<()> {
    match measures.iter().find(|m| !map.contains(**m)) {
        Some(unknown) => Err(AdapterError::UnknownMeasure {
            measure: unknown.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

/// A lazy range scan over either kind of file.
#[derive(Debug)]
pub enum RangeScan<'a> {
    /// Scan over a CSV file.
    Csv(CsvScan<'a>),
    /// Scan over a Parquet file.
    Parquet(ParquetScan<'a>),
}

impl RangeScan<'_> {
    /// The clamped range being scanned.
    pub fn range(&self) -> TimeRange {
        match self {
            Self::Csv(s) => s.range(),
            Self::Parquet(s) => s.range(),
        }
    }

    /// Name of the scanned file.
    pub fn label(&self) -> &str {
        match self {
            Self::Csv(s) => s.label(),
            Self::Parquet(s) => s.label(),
        }
    }

    /// Measures projected into `fields[1..]`, in order.
    pub fn measures(&self) -> &[MeasureId] {
        match self {
            Self::Csv(s) => s.measures(),
            Self::Parquet(s) => s.measures(),
        }
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Csv(s) => s.next(),
            Self::Parquet(s) => s.next(),
        }
    }
}

/// A flat file source selected by format.
#[derive(Debug)]
pub enum FileSource {
    /// Delimited text.
    Csv(CsvSource),
    /// Parquet row groups.
    Parquet(ParquetSource),
}

impl FileSource {
    /// Opens and samples the file described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid, and access errors
    /// if the file cannot be opened, is empty, or lacks a configured column.
    pub fn open(config: &DatasetConfig) -> Result<Self> {
        config.validate()?;
        match config.resolved_format()? {
            FileFormat::Csv => CsvSource::open(config).map(Self::Csv),
            FileFormat::Parquet => ParquetSource::open(config).map(Self::Parquet),
        }
    }

    /// Replaces the sampled layout.
    ///
    /// Lookups stay exact for any initialized layout; a poor one only costs
    /// correction steps.
    pub fn set_layout(&mut self, layout: SampledLayout) {
        match self {
            Self::Csv(s) => s.set_layout(layout),
            Self::Parquet(s) => s.set_layout(layout),
        }
    }

    /// Total correction steps taken by lookups so far.
    pub fn correction_steps(&self) -> u64 {
        match self {
            Self::Csv(s) => s.correction_steps(),
            Self::Parquet(s) => s.correction_steps(),
        }
    }
}

impl TimeIndexed for FileSource {
    fn label(&self) -> &str {
        match self {
            Self::Csv(s) => s.label(),
            Self::Parquet(s) => s.label(),
        }
    }

    fn layout(&self) -> &SampledLayout {
        match self {
            Self::Csv(s) => s.layout(),
            Self::Parquet(s) => s.layout(),
        }
    }

    fn measures(&self) -> &MeasureMap {
        match self {
            Self::Csv(s) => s.measures(),
            Self::Parquet(s) => s.measures(),
        }
    }

    fn locate_record(&mut self, timestamp: i64) -> Result<RecordLocation> {
        match self {
            Self::Csv(s) => s.locate_record(timestamp),
            Self::Parquet(s) => s.locate_record(timestamp),
        }
    }

    fn scan(&mut self, range: TimeRange, measures: &[MeasureId]) -> Result<RangeScan<'_>> {
        match self {
            Self::Csv(s) => s.scan(range, measures),
            Self::Parquet(s) => s.scan(range, measures),
        }
    }
}
