//! Byte-addressed random access into delimited text files.

use std::fs::File;

use tracing::{debug, trace};

use super::{RangeScan, RawRecord, RecordLocation, TimeIndexed, check_bounds, check_measures};
use crate::adapter::{MeasureId, MeasureMap};
use crate::config::{DatasetConfig, TimeFormat};
use crate::error::{AccessError, FourfoldError, Result};
use crate::layout::{Estimate, LayoutSampler, SampledLayout};
use crate::range::TimeRange;
use crate::reader::{BufferedBidirectionalReader, Line};

/// Splits one line into fields.
///
/// Fields may be wrapped in double quotes, in which case the delimiter loses
/// its meaning inside them and `""` stands for a literal quote.
pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            }
            '"' if field.is_empty() => quoted = true,
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// A parsed line: where it is, when it is, and its fields.
#[derive(Debug)]
struct Parsed {
    offset: u64,
    end: u64,
    timestamp: i64,
    fields: Vec<String>,
}

/// A CSV file opened for time-indexed access.
#[derive(Debug)]
pub struct CsvSource {
    reader: BufferedBidirectionalReader<File>,
    delimiter: char,
    time_format: TimeFormat,
    time_index: usize,
    columns: Vec<usize>,
    data_start: u64,
    measures: MeasureMap,
    layout: SampledLayout,
    correction_steps: u64,
}

impl CsvSource {
    /// Opens the file, reads its header and samples its layout.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] if the file cannot be read,
    /// [`AccessError::EmptySource`] if it has no data records,
    /// [`AccessError::UnknownColumn`] if a configured column is missing and
    /// [`AccessError::CorruptRecord`] if a sampled record cannot be parsed.
    pub fn open(config: &DatasetConfig) -> Result<Self> {
        let reader = BufferedBidirectionalReader::open(&config.path, config.buffer_size)?;
        let measures = MeasureMap::new(config.measures.iter().cloned())?;

        let mut source = Self {
            reader,
            delimiter: config.delimiter,
            time_format: config.time_format.clone(),
            time_index: 0,
            columns: Vec::new(),
            data_start: 0,
            measures,
            layout: SampledLayout::default(),
            correction_steps: 0,
        };

        let header = if config.has_header {
            let line = source.reader.read_line()?.ok_or_else(|| source.empty())?;
            source.reader.set_floor(line.end);
            source.data_start = line.end;
            Some(split_fields(&line.text, source.delimiter))
        } else {
            None
        };

        source.time_index = match &config.time_column {
            Some(name) => source.resolve_column(header.as_deref(), name)?,
            None => 0,
        };
        source.columns = config
            .measures
            .iter()
            .map(|name| source.resolve_column(header.as_deref(), name))
            .collect::<Result<_>>()?;

        source.layout = source.sample(config.sample_fraction)?;
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

    /// Number of reader window refills so far.
    pub fn rebuffer_count(&self) -> u64 {
        self.reader.rebuffer_count()
    }

    fn empty(&self) -> FourfoldError {
        AccessError::EmptySource {
            path: self.reader.label().to_string(),
        }
        .into()
    }

    fn resolve_column(&self, header: Option<&[String]>, name: &str) -> Result<usize> {
        let found = match header {
            Some(header) => header.iter().position(|h| h.trim() == name),
            None => name.parse().ok(),
        };
        found.ok_or_else(|| {
            AccessError::UnknownColumn {
                path: self.reader.label().to_string(),
                column: name.to_string(),
            }
            .into()
        })
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )] // sample budget is a byte count
    fn sample(&mut self, fraction: f64) -> Result<SampledLayout> {
        let data_start = self.data_start;
        let data_bytes = self.reader.len().saturating_sub(data_start);
        let budget = (data_bytes as f64 * fraction).ceil() as u64;

        let mut sampler = LayoutSampler::new();
        self.reader.seek_forward(data_start);
        while sampler.bytes() < budget || sampler.records() < 2 {
            let Some(record) = self.next_record()? else {
                break;
            };
            sampler.observe(record.timestamp, record.end - record.offset);
        }

        self.reader.seek_backward(self.reader.len());
        let terminal = self.next_record()?.ok_or_else(|| self.empty())?;

        let layout = sampler
            .finish(terminal.timestamp, data_start, self.reader.len())
            .ok_or_else(|| self.empty())?;
        debug!(
            source = self.reader.label(),
            start = layout.start_time,
            end = layout.end_time,
            interval = layout.sampling_interval,
            sampled = sampler.records(),
            "sampled csv layout"
        );
        Ok(layout)
    }

    fn parse(&self, line: Line) -> Result<Parsed> {
        let fields = split_fields(&line.text, self.delimiter);
        let corrupt = |reason: String| AccessError::CorruptRecord {
            path: self.reader.label().to_string(),
            offset: line.offset,
            reason,
        };

        let text = fields
            .get(self.time_index)
            .ok_or_else(|| corrupt(format!("missing time column {}", self.time_index)))?;
        let timestamp = self
            .time_format
            .parse(text)
            .ok_or_else(|| corrupt(format!("unparsable timestamp '{text}'")))?;

        Ok(Parsed {
            offset: line.offset,
            end: line.end,
            timestamp,
            fields,
        })
    }

    /// Reads the next non-blank record in the reader's direction.
    fn next_record(&mut self) -> Result<Option<Parsed>> {
        loop {
            let Some(line) = self.reader.read_line()? else {
                return Ok(None);
            };
            if line.text.trim().is_empty() {
                continue;
            }
            return self.parse(line).map(Some);
        }
    }

    fn out_of_range(&self, timestamp: i64) -> FourfoldError {
        AccessError::OutOfRange {
            timestamp,
            start: self.layout.start_time,
            end: self.layout.end_time,
        }
        .into()
    }
}

impl TimeIndexed for CsvSource {
    fn label(&self) -> &str {
        self.reader.label()
    }

    fn layout(&self) -> &SampledLayout {
        &self.layout
    }

    fn measures(&self) -> &MeasureMap {
        &self.measures
    }

    fn locate_record(&mut self, timestamp: i64) -> Result<RecordLocation> {
        self.layout.ensure_initialized(self.reader.label())?;
        check_bounds(&self.layout, timestamp)?;

        let guess = match self.layout.estimate(timestamp) {
            Estimate::Byte(offset) => offset,
            Estimate::Partition(_) => self.data_start,
        };
        self.reader.seek_forward(guess);
        self.reader.align_forward()?;

        let mut current = match self.next_record()? {
            Some(record) => record,
            None => {
                self.reader.seek_backward(self.reader.len());
                self.next_record()?.ok_or_else(|| self.empty())?
            }
        };

        let mut steps = 0u64;
        if current.timestamp > timestamp {
            self.reader.seek_backward(current.offset);
            loop {
                let previous = self
                    .next_record()?
                    .ok_or_else(|| self.out_of_range(timestamp))?;
                steps += 1;
                if previous.timestamp <= timestamp {
                    current = previous;
                    break;
                }
            }
        } else {
            self.reader.seek_forward(current.end);
            while let Some(next) = self.next_record()? {
                if next.timestamp > timestamp {
                    break;
                }
                steps += 1;
                current = next;
            }
        }

        self.correction_steps += steps;
        debug!(
            source = self.reader.label(),
            timestamp,
            guess,
            offset = current.offset,
            steps,
            "located record"
        );
        Ok(RecordLocation {
            offset: current.offset,
            timestamp: current.timestamp,
        })
    }

    fn scan(&mut self, range: TimeRange, measures: &[MeasureId]) -> Result<RangeScan<'_>> {
        check_measures(&self.measures, measures)?;
        let range = self.clamp(range)?;

        let (start, upper) = if range.is_empty() {
            (self.reader.len(), 0)
        } else {
            // Start before the first record at `from`; duplicates of `from` all precede
            // the last one, so locating `from` itself would skip them.
            let start = if range.from() > self.layout.start_time {
                self.locate_record(range.from() - 1)?.offset
            } else {
                self.data_start
            };
            let upper = self.locate_record(range.to() - 1)?;
            (start, upper.offset)
        };
        self.reader.seek_forward(start);
        trace!(source = self.reader.label(), %range, start, upper, "csv scan positioned");

        Ok(RangeScan::Csv(CsvScan {
            source: self,
            range,
            measures: measures.to_vec(),
            upper,
            last_timestamp: None,
            done: range.is_empty(),
        }))
    }
}

/// Forward scan over the records of a CSV range.
#[derive(Debug)]
pub struct CsvScan<'a> {
    source: &'a mut CsvSource,
    range: TimeRange,
    measures: Vec<MeasureId>,
    upper: u64,
    last_timestamp: Option<i64>,
    done: bool,
}

impl CsvScan<'_> {
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
        self.source.label()
    }

    fn advance(&mut self) -> Result<Option<RawRecord>> {
        loop {
            let Some(record) = self.source.next_record()? else {
                return Ok(None);
            };
            if record.offset > self.upper || record.timestamp >= self.range.to() {
                return Ok(None);
            }
            if record.timestamp < self.range.from() {
                continue;
            }
            if self.last_timestamp.is_some_and(|last| record.timestamp < last) {
                return Err(AccessError::CorruptRecord {
                    path: self.source.reader.label().to_string(),
                    offset: record.offset,
                    reason: format!("timestamp {} is out of order", record.timestamp),
                }
                .into());
            }
            self.last_timestamp = Some(record.timestamp);

            let mut fields = Vec::with_capacity(self.measures.len() + 1);
            fields.push(
                record
                    .fields
                    .get(self.source.time_index)
                    .cloned()
                    .unwrap_or_default(),
            );
            for measure in &self.measures {
                let column = self.source.columns[measure.0 as usize];
                fields.push(record.fields.get(column).cloned().unwrap_or_default());
            }

            return Ok(Some(RawRecord {
                offset: record.offset,
                timestamp: record.timestamp,
                fields,
            }));
        }
    }
}

impl Iterator for CsvScan<'_> {
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
