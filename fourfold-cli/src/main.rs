//! CLI for fourfold.
//!
//! Inspects the sampled layout of a flat time-series file, locates records by
//! timestamp and runs M4 queries over it.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use fourfold::access::{FileSource, TimeIndexed};
use fourfold::config::{DatasetConfig, TimeFormat};
use fourfold::query::{M4Query, run_file};
use fourfold::{AggregatePoint, GapPolicy, MeasureMap, TimeRange};
use tracing_subscriber::EnvFilter;

/// fourfold: boundary-exact M4 downsampling over flat files.
#[derive(Parser)]
#[command(name = "fourfold", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Sample a file and print its layout.
    Layout {
        #[command(flatten)]
        dataset: DatasetArgs,
    },

    /// Find the record holding a timestamp.
    Locate {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Timestamp in epoch milliseconds.
        timestamp: i64,
    },

    /// Summarize a time range into M4 buckets.
    Query {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Start of the range (epoch milliseconds, inclusive).
        #[arg(long)]
        from: i64,

        /// End of the range (epoch milliseconds, exclusive).
        #[arg(long)]
        to: i64,

        /// Number of buckets.
        #[arg(long, default_value = "100")]
        buckets: u32,

        /// How to report buckets without data.
        #[arg(long, default_value = "empty")]
        gaps: Gaps,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Flags describing the dataset file.
#[derive(Args)]
struct DatasetArgs {
    /// Path to the CSV or Parquet file.
    file: PathBuf,

    /// JSON dataset configuration; flags given here override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name (or index, without a header) of the time column.
    #[arg(long)]
    time_column: Option<String>,

    /// Time encoding: ms, s, us, rfc3339 or a chrono pattern.
    #[arg(long)]
    time_format: Option<TimeFormat>,

    /// Measure column; repeat for several.
    #[arg(long = "measure")]
    measures: Vec<String>,

    /// Field delimiter for CSV files.
    #[arg(long)]
    delimiter: Option<char>,

    /// The CSV file has no header line.
    #[arg(long)]
    no_header: bool,

    /// Reader window size in bytes.
    #[arg(long)]
    buffer_size: Option<usize>,
}

impl DatasetArgs {
    fn resolve(self) -> Result<DatasetConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => DatasetConfig::load(path)?,
            None => DatasetConfig::new(&self.file, Vec::new()),
        };
        config.path = self.file;
        if self.time_column.is_some() {
            config.time_column = self.time_column;
        }
        if let Some(time_format) = self.time_format {
            config.time_format = time_format;
        }
        if !self.measures.is_empty() {
            config.measures = self.measures;
        }
        if let Some(delimiter) = self.delimiter {
            config.delimiter = delimiter;
        }
        if self.no_header {
            config.has_header = false;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Gap policy as a flag value.
#[derive(Clone, ValueEnum)]
enum Gaps {
    /// Emit empty buckets.
    Empty,
    /// Leave empty buckets out.
    Omit,
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object with metadata and points.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Layout { dataset } => cmd_layout(dataset),
        Commands::Locate { dataset, timestamp } => cmd_locate(dataset, timestamp),
        Commands::Query {
            dataset,
            from,
            to,
            buckets,
            gaps,
            format,
        } => cmd_query(dataset, TimeRange::new(from, to), buckets, &gaps, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `fourfold layout <file>`.
fn cmd_layout(dataset: DatasetArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = dataset.resolve()?;
    let source = FileSource::open(&config)?;

    let output = serde_json::json!({
        "file": source.label(),
        "measures": source.measures().names(),
        "layout": source.layout(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Implements `fourfold locate <file> <timestamp>`.
fn cmd_locate(dataset: DatasetArgs, timestamp: i64) -> Result<(), Box<dyn std::error::Error>> {
    let config = dataset.resolve()?;
    let mut source = FileSource::open(&config)?;

    let location = source.locate_record(timestamp)?;
    println!("offset={}", location.offset);
    println!("timestamp={}", location.timestamp);
    println!("correction_steps={}", source.correction_steps());
    Ok(())
}

/// Implements `fourfold query <file> --from --to`.
fn cmd_query(
    dataset: DatasetArgs,
    range: fourfold::Result<TimeRange>,
    buckets: u32,
    gaps: &Gaps,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = dataset.resolve()?;
    let mut source = FileSource::open(&config)?;
    let names = source.measures().clone();

    let gaps = match gaps {
        Gaps::Empty => GapPolicy::EmitEmpty,
        Gaps::Omit => GapPolicy::Omit,
    };
    let query = M4Query::new(range?, buckets, names.ids())?.with_gaps(gaps);

    let result = run_file(&mut source, &query)?;
    let requested = result.requested_range();
    let served = result.served_range();
    let incomplete = result.may_be_incomplete();
    let points = result.collect_all()?;

    match format {
        OutputFormat::Csv => {
            println!(
                "# requested={requested}, served={served}, incomplete={incomplete}, points={}",
                points.len()
            );
            println!("{}", csv_header(&names));
            for point in &points {
                println!("{}", csv_row(point, &names));
            }
        }
        OutputFormat::Json => {
            let data: Vec<serde_json::Value> =
                points.iter().map(|point| json_point(point, &names)).collect();

            let output = serde_json::json!({
                "requested": requested,
                "served": served,
                "may_be_incomplete": incomplete,
                "count": points.len(),
                "data": data,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn csv_header(names: &MeasureMap) -> String {
    let mut columns = vec!["from".to_string(), "to".to_string()];
    for name in names.names() {
        for stat in ["min", "max", "first", "last", "count"] {
            columns.push(format!("{name}_{stat}"));
        }
    }
    columns.join(",")
}

fn csv_row(point: &AggregatePoint, names: &MeasureMap) -> String {
    let mut fields = vec![point.bucket.from().to_string(), point.bucket.to().to_string()];
    for id in names.ids() {
        match point.get(id) {
            Some(stats) => fields.extend([
                stats.min.to_string(),
                stats.max.to_string(),
                stats.first.to_string(),
                stats.last.to_string(),
                stats.count.to_string(),
            ]),
            None => fields.extend(["", "", "", "", "0"].map(String::from)),
        }
    }
    fields.join(",")
}

fn json_point(point: &AggregatePoint, names: &MeasureMap) -> serde_json::Value {
    let measures: serde_json::Map<String, serde_json::Value> = point
        .measures
        .iter()
        .filter_map(|(id, stats)| {
            let name = names.name_of(*id)?;
            Some((name.to_string(), serde_json::to_value(stats).ok()?))
        })
        .collect();

    serde_json::json!({
        "from": point.bucket.from(),
        "to": point.bucket.to(),
        "measures": measures,
    })
}
