//! # fourfold
//!
//! Boundary-exact M4 downsampling over flat files and heterogeneous backend
//! streams.
//!
//! fourfold turns a time range of a multivariate series into a fixed number of
//! buckets, each summarized by its min, max, first and last value per measure
//! (the M4 scheme). The same bucket stream comes out whether the series lives
//! in a CSV or Parquet file with no index at all, or behind a relational,
//! time-series or Arrow backend that already did part of the work.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Timestamp lookups in flat files by interpolation search, exact no matter
//!   how poor the estimate; no index is ever persisted
//! - Bounded memory: one reader window per file and one open bucket per query
//! - Bucket ranges derived from the query grid, never from the data
//! - Sub-queries ("union groups") never merged into each other's buckets
//! - Corrupt records and misordered cursors fail the query instead of
//!   silently dropping buckets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fourfold::{DatasetConfig, FileSource, M4Query, MeasureId, TimeRange};
//! use fourfold::query::run_file;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DatasetConfig::new("./metrics.csv", vec!["cpu".into(), "mem".into()]);
//! let mut source = FileSource::open(&config)?;
//!
//! let query = M4Query::new(TimeRange::new(0, 3_600_000)?, 800, vec![MeasureId(0)])?;
//! for point in run_file(&mut source, &query)? {
//!     let point = point?;
//!     if let Some(cpu) = point.get(MeasureId(0)) {
//!         println!("{}: min={} max={}", point.bucket, cpu.min, cpu.max);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`FileSource`] — time-indexed random access into CSV and Parquet files
//! - [`BackendAdapter`] — turns a backend cursor into raw tuples
//! - [`AggregationMergeIterator`] — regroups tuples into [`AggregatePoint`]s
//! - [`M4Query`] / [`QueryResult`] — query validation and execution
//!
//! ## Modules
//!
//! - [`range`] — Time ranges and the bucket grid
//! - [`layout`] — Sampled file layout and offset estimation
//! - [`reader`] — Buffered bidirectional line reader
//! - [`access`] — Time-indexed access to CSV and Parquet files
//! - [`stats`] — Per-bucket statistics
//! - [`adapter`] — Backend result adapters
//! - [`merge`] — The aggregation merge engine
//! - [`query`] — Query execution
//! - [`config`] — Dataset configuration
//! - [`error`] — Error types

pub mod access;
pub mod adapter;
pub mod config;
pub mod error;
pub mod layout;
pub mod merge;
pub mod query;
pub mod range;
pub mod reader;
pub mod stats;

// Re-export primary API types at crate root for convenience.
pub use access::{FileSource, RawRecord, TimeIndexed};
pub use adapter::{BackendAdapter, MeasureId, MeasureMap, RawTuple, Role};
pub use config::DatasetConfig;
pub use error::{FourfoldError, Result};
pub use layout::SampledLayout;
pub use merge::{AggregationMergeIterator, GapPolicy};
pub use query::{M4Query, QueryResult};
pub use range::{BucketGrid, TimeRange};
pub use stats::{AggregatePoint, MeasureStats};
