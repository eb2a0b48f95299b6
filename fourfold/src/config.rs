//! Dataset configuration for flat time-series files.
//!
//! A [`DatasetConfig`] tells [`access`](crate::access) how to read one file:
//! which column holds the timestamp and how it is encoded, which columns are
//! the measures, and how large the reader window and the layout sample are.
//! Configurations are plain serde structs and can be loaded from JSON.
//!
//! ```json
//! {
//!   "path": "data/sensors.csv",
//!   "time_column": "timestamp",
//!   "time_format": "rfc3339",
//!   "measures": ["temperature", "humidity"]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default reader window: 64 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default share of the data sampled to build the layout.
pub const DEFAULT_SAMPLE_FRACTION: f64 = 0.2;

/// Physical format of a dataset file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Delimited text, one record per line.
    Csv,
    /// Parquet, addressed by row group.
    Parquet,
}

impl FileFormat {
    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(Self::Csv),
            "parquet" | "pq" => Some(Self::Parquet),
            _ => None,
        }
    }
}

/// Encoding of the time column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    /// Integer milliseconds since the Unix epoch.
    #[default]
    EpochMillis,
    /// Seconds since the Unix epoch, optionally fractional.
    EpochSeconds,
    /// Integer microseconds since the Unix epoch.
    EpochMicros,
    /// RFC 3339 timestamps with offset.
    Rfc3339,
    /// A chrono `strftime` pattern, interpreted as UTC.
    Pattern(String),
}

impl TimeFormat {
    /// Parses `text` into epoch milliseconds.
    ///
    /// Returns `None` if the text does not match the format.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fourfold::config::TimeFormat;
    ///
    /// assert_eq!(TimeFormat::EpochSeconds.parse("1.5"), Some(1_500));
    /// assert_eq!(TimeFormat::Rfc3339.parse("1970-01-01T00:00:01Z"), Some(1_000));
    /// assert_eq!(TimeFormat::EpochMillis.parse("soon"), None);
    /// ```
    #[allow(clippy::cast_possible_truncation)] // fractional seconds rounded to millis
    pub fn parse(&self, text: &str) -> Option<i64> {
        let text = text.trim();
        match self {
            Self::EpochMillis => text.parse().ok(),
            Self::EpochMicros => text.parse::<i64>().ok().map(|us| us.div_euclid(1_000)),
            Self::EpochSeconds => match text.parse::<i64>() {
                Ok(secs) => secs.checked_mul(1_000),
                Err(_) => {
                    let secs: f64 = text.parse().ok()?;
                    secs.is_finite().then(|| (secs * 1_000.0).round() as i64)
                }
            },
            Self::Rfc3339 => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            Self::Pattern(pattern) => NaiveDateTime::parse_from_str(text, pattern)
                .map(|dt| dt.and_utc().timestamp_millis())
                .or_else(|_| {
                    NaiveDate::parse_from_str(text, pattern)
                        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis())
                })
                .ok(),
        }
    }
}

impl FromStr for TimeFormat {
    type Err = std::convert::Infallible;

    /// Known names select a fixed format; anything else is a chrono pattern.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "epoch_millis" | "millis" | "ms" => Self::EpochMillis,
            "epoch_seconds" | "seconds" | "s" => Self::EpochSeconds,
            "epoch_micros" | "micros" | "us" => Self::EpochMicros,
            "rfc3339" => Self::Rfc3339,
            pattern => Self::Pattern(pattern.to_string()),
        })
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_has_header() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_sample_fraction() -> f64 {
    DEFAULT_SAMPLE_FRACTION
}

/// Description of one flat time-series file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path of the file.
    pub path: PathBuf,

    /// File format; inferred from the extension when absent.
    #[serde(default)]
    pub format: Option<FileFormat>,

    /// Name of the time column (or its index for header-less CSV).
    ///
    /// Defaults to the first column.
    #[serde(default)]
    pub time_column: Option<String>,

    /// Encoding of the time column.
    #[serde(default)]
    pub time_format: TimeFormat,

    /// Measure column names; a measure's id is its position in this list.
    pub measures: Vec<String>,

    /// CSV field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Whether the first CSV line is a header.
    #[serde(default = "default_has_header")]
    pub has_header: bool,

    /// Reader window size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Share of the data read when sampling the layout, in `(0, 1]`.
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,
}

impl DatasetConfig {
    /// Creates a configuration with default settings.
    ///
    /// # Arguments
    ///
    /// * `path` - The dataset file
    /// * `measures` - Measure column names, in measure-id order
    pub fn new(path: impl Into<PathBuf>, measures: Vec<String>) -> Self {
        Self {
            path: path.into(),
            format: None,
            time_column: None,
            time_format: TimeFormat::default(),
            measures,
            delimiter: default_delimiter(),
            has_header: default_has_header(),
            buffer_size: default_buffer_size(),
            sample_fraction: default_sample_fraction(),
        }
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// A relative `path` inside the file is resolved against the directory
    /// containing the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, and
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut config: DatasetConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?;

        if config.path.is_relative()
            && let Some(dir) = path.parent()
        {
            config.path = dir.join(&config.path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if there are no measures, the buffer
    /// size is zero, the sample fraction is outside `(0, 1]`, or the delimiter
    /// is not a single-byte character usable as a separator.
    pub fn validate(&self) -> Result<()> {
        if self.measures.is_empty() {
            return Err(invalid("at least one measure is required"));
        }

        if self.buffer_size == 0 {
            return Err(invalid("buffer_size cannot be zero"));
        }

        if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
            return Err(invalid(format!(
                "sample_fraction must be in (0, 1], got {}",
                self.sample_fraction
            )));
        }

        if !self.delimiter.is_ascii() || matches!(self.delimiter, '\n' | '\r' | '"') {
            return Err(invalid(format!(
                "unsupported delimiter {:?}",
                self.delimiter
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for name in &self.measures {
            if !seen.insert(name) {
                return Err(invalid(format!("measure '{name}' listed twice")));
            }
        }

        Ok(())
    }

    /// Returns the configured format, or the one implied by the extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if neither is available.
    pub fn resolved_format(&self) -> Result<FileFormat> {
        self.format
            .or_else(|| FileFormat::from_path(&self.path))
            .ok_or_else(|| {
                invalid(format!(
                    "cannot infer the format of '{}'; set `format`",
                    self.path.display()
                ))
            })
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::FourfoldError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}
