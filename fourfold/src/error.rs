//! Error types for fourfold.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

/// The main error type for all fourfold operations.
///
/// Each variant wraps the error enum of one concern: random access into flat
/// files, backend result adaptation, query validation, and configuration.
#[derive(Error, Debug)]
pub enum FourfoldError {
    /// Error while locating or materializing records in a flat file.
    #[error("access error: {0}")]
    Access(#[from] AccessError),

    /// Error while adapting a backend result stream.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Error in the shape of a query.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error loading or validating a dataset configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by the time-indexed random access path.
#[derive(Error, Debug)]
pub enum AccessError {
    /// The timestamp lies outside the time range covered by the source.
    #[error("timestamp {timestamp} is outside the source range [{start}, {end}]")]
    OutOfRange {
        /// The requested timestamp (or range bound).
        timestamp: i64,
        /// Timestamp of the first record.
        start: i64,
        /// Timestamp of the last record.
        end: i64,
    },

    /// The source holds no data records.
    #[error("source '{path}' contains no records")]
    EmptySource {
        /// The source path.
        path: String,
    },

    /// A record could not be parsed.
    #[error("corrupt record in '{path}' at offset {offset}: {reason}")]
    CorruptRecord {
        /// The source path.
        path: String,
        /// Byte offset (flat files) or row ordinal (partitioned files).
        offset: u64,
        /// What was wrong with the record.
        reason: String,
    },

    /// A lookup was attempted before the layout was sampled.
    #[error("layout of '{path}' has not been sampled")]
    UninitializedLayout {
        /// The source path.
        path: String,
    },

    /// Underlying I/O failure.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The source path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configured column does not exist in the source.
    #[error("column '{column}' not found in '{path}'")]
    UnknownColumn {
        /// The source path.
        path: String,
        /// The missing column name.
        column: String,
    },

    /// Failure reading Parquet metadata or pages.
    #[error("parquet error on '{path}': {source}")]
    Parquet {
        /// The source path.
        path: String,
        /// The underlying Parquet error.
        #[source]
        source: ParquetError,
    },

    /// Failure decoding Arrow arrays read from a file.
    #[error("arrow error on '{path}': {source}")]
    Arrow {
        /// The source path.
        path: String,
        /// The underlying Arrow error.
        #[source]
        source: ArrowError,
    },
}

/// Errors raised while turning backend cursors into raw tuples.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The backend cursor violated an ordering or shape assumption.
    #[error("adapter protocol violation: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },

    /// A measure id or name is not part of the query's measure mapping.
    #[error("unknown measure '{measure}'")]
    UnknownMeasure {
        /// The offending measure id or name.
        measure: String,
    },

    /// The relational cursor failed.
    #[error("sql cursor error: {source}")]
    Sql {
        /// The underlying rusqlite error.
        #[source]
        source: rusqlite::Error,
    },

    /// The record batch stream failed.
    #[error("record batch stream error: {source}")]
    Arrow {
        /// The underlying Arrow error.
        #[source]
        source: ArrowError,
    },
}

impl AdapterError {
    /// Shorthand for a [`AdapterError::Protocol`] violation.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// Errors describing an ill-formed query.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is inverted.
    #[error("invalid time range: from {from} > to {to}")]
    InvalidTimeRange {
        /// The start of the range.
        from: i64,
        /// The end of the range.
        to: i64,
    },

    /// The bucket count is zero or wider than the range allows.
    #[error("cannot split [{from}, {to}) into {count} buckets")]
    InvalidBucketCount {
        /// The requested bucket count.
        count: u32,
        /// The start of the range.
        from: i64,
        /// The end of the range.
        to: i64,
    },

    /// The query selects no measures.
    #[error("query selects no measures")]
    NoMeasures,
}

/// Errors loading or validating a [`DatasetConfig`](crate::config::DatasetConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Load {
        /// The config path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for a dataset.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The config path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of bounds.
    #[error("invalid dataset configuration: {reason}")]
    Invalid {
        /// What makes the configuration invalid.
        reason: String,
    },
}

/// Type alias for `Result<T, FourfoldError>`.
pub type Result<T> = std::result::Result<T, FourfoldError>;
