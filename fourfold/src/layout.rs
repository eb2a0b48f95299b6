//! Sampled file layout and the timestamp-to-offset estimator.
//!
//! A [`SampledLayout`] is a linear model of a time-ordered file: records are
//! assumed to arrive every `sampling_interval` milliseconds starting at
//! `start_time`, and (for flat files) to occupy `mean_record_bytes` bytes each.
//! The model only seeds the search in [`access`](crate::access); it is never
//! trusted for correctness and never persisted.
//!
//! # Estimation
//!
//! ```text
//! ordinal   = (t - start_time) / sampling_interval
//! byte      = min(data_start + ordinal * mean_record_bytes, data_end - safety_margin)
//! partition = min(ordinal / records_per_partition, partition_count - 1)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};

/// How records of a file are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Addressing {
    /// Line-oriented files addressed by byte offset.
    Bytes {
        /// Mean size of one record line, terminator included.
        mean_record_bytes: f64,
        /// Offset of the first data record (after any header).
        data_start: u64,
        /// File length.
        data_end: u64,
    },
    /// Columnar files addressed by partition (row group) index.
    Partitions {
        /// Rows per partition as sampled from the file.
        records_per_partition: u64,
        /// Number of partitions in the file.
        partition_count: usize,
    },
}

/// Result of estimating where a timestamp lives in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimate {
    /// Approximate byte offset in a line-oriented file.
    Byte(u64),
    /// Approximate partition index in a columnar file.
    Partition(usize),
}

/// Per-file metadata sampled once before any lookup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampledLayout {
    /// Timestamp of the first record.
    pub start_time: i64,
    /// Timestamp of the last record.
    pub end_time: i64,
    /// Milliseconds between consecutive records (near-constant by assumption).
    pub sampling_interval: i64,
    /// Number of records the sample saw (a lower bound for flat files).
    pub record_count_hint: u64,
    /// How records are addressed.
    pub addressing: Addressing,
}

impl Default for SampledLayout {
    /// An uninitialized layout: every lookup against it fails fast.
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: 0,
            sampling_interval: 0,
            record_count_hint: 0,
            addressing: Addressing::Bytes {
                mean_record_bytes: 0.0,
                data_start: 0,
                data_end: 0,
            },
        }
    }
}

impl SampledLayout {
    /// Returns `true` once the sampling interval and record size are positive.
    pub fn is_initialized(&self) -> bool {
        let addressing_ok = match self.addressing {
            Addressing::Bytes {
                mean_record_bytes, ..
            } => mean_record_bytes > 0.0 && mean_record_bytes.is_finite(),
            Addressing::Partitions {
                records_per_partition,
                partition_count,
            } => records_per_partition > 0 && partition_count > 0,
        };
        self.sampling_interval > 0 && addressing_ok
    }

    /// Fails with [`AccessError::UninitializedLayout`] unless initialized.
    ///
    /// # Errors
    ///
    /// Returns an error naming `path` if the layout was never sampled.
    pub fn ensure_initialized(&self, path: &str) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(AccessError::UninitializedLayout {
                path: path.to_string(),
            }
            .into())
        }
    }

    /// Estimated record ordinal of `timestamp` (zero before `start_time`).
    #[allow(clippy::cast_sign_loss)] // clamped to non-negative first
    pub fn estimate_ordinal(&self, timestamp: i64) -> u64 {
        if self.sampling_interval <= 0 {
            return 0;
        }
        (timestamp.saturating_sub(self.start_time) / self.sampling_interval).max(0) as u64
    }

    /// Estimates the byte offset or partition holding `timestamp`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )] // estimates only; clamped into the file bounds
    pub fn estimate(&self, timestamp: i64) -> Estimate {
        let ordinal = self.estimate_ordinal(timestamp);
        match self.addressing {
            Addressing::Bytes {
                mean_record_bytes,
                data_start,
                data_end,
            } => {
                let safety_margin = mean_record_bytes.ceil().max(1.0) as u64;
                let upper = data_end.saturating_sub(safety_margin).max(data_start);
                let offset = data_start.saturating_add((ordinal as f64 * mean_record_bytes) as u64);
                Estimate::Byte(offset.min(upper))
            }
            Addressing::Partitions {
                records_per_partition,
                partition_count,
            } => {
                let partition = ordinal / records_per_partition.max(1);
                let last = partition_count.saturating_sub(1);
                Estimate::Partition(usize::try_from(partition).map_or(last, |p| p.min(last)))
            }
        }
    }

    /// Returns the inclusive `[start_time, end_time]` bounds of the file.
    pub fn time_bounds(&self) -> (i64, i64) {
        (self.start_time, self.end_time)
    }
}

/// Accumulates prefix observations into a byte-addressed [`SampledLayout`].
///
/// Callers feed the records of a prefix scan in file order, then supply the
/// terminal record's timestamp (read backward from the end of the file).
#[derive(Debug, Clone, Default)]
pub struct LayoutSampler {
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    records: u64,
    bytes: u64,
}

impl LayoutSampler {
    /// Creates an empty sampler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sampled record of `record_bytes` bytes (terminator included).
    pub fn observe(&mut self, timestamp: i64, record_bytes: u64) {
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(timestamp);
        }
        self.last_timestamp = Some(timestamp);
        self.records += 1;
        self.bytes += record_bytes;
    }

    /// Number of records observed so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of bytes observed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Produces the layout, or `None` if no record was observed.
    ///
    /// A single-record sample gets a one-millisecond interval: the estimate is
    /// meaningless for such a file but the correction scan stays exact.
    #[allow(clippy::cast_precision_loss)] // byte counts well below 2^52
    pub fn finish(&self, end_time: i64, data_start: u64, data_end: u64) -> Option<SampledLayout> {
        let first = self.first_timestamp?;
        let last = self.last_timestamp?;

        let sampling_interval = if self.records > 1 {
            let span = last.saturating_sub(first);
            let steps = i64::try_from(self.records - 1).unwrap_or(i64::MAX);
            (span / steps).max(1)
        } else {
            1
        };

        Some(SampledLayout {
            start_time: first,
            end_time: end_time.max(last),
            sampling_interval,
            record_count_hint: self.records,
            addressing: Addressing::Bytes {
                mean_record_bytes: self.bytes as f64 / self.records as f64,
                data_start,
                data_end,
            },
        })
    }
}
