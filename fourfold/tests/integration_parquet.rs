//! Integration tests for partition-addressed access to Parquet files.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use fourfold::access::FileSource;
use fourfold::config::TimeFormat;
use fourfold::error::{AccessError, FourfoldError};
use fourfold::layout::Addressing;
use fourfold::query::run_file;
use fourfold::{DatasetConfig, M4Query, MeasureId, TimeIndexed, TimeRange};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tempfile::tempdir;

const ROWS: i64 = 95;

fn timestamp(row: i64) -> i64 {
    1_000 + row * 50
}

fn write_parquet(path: &Path, time: ArrayRef, cpu: Vec<Option<f64>>) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("time", time.data_type().clone(), true),
        Field::new("cpu", DataType::Float64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![time, Arc::new(Float64Array::from(cpu)) as ArrayRef],
    )
    .unwrap();

    let props = WriterProperties::builder().set_max_row_group_size(10).build();
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn millis_series(path: &Path) {
    let times: Vec<i64> = (0..ROWS).map(timestamp).collect();
    let cpu = (0..ROWS).map(|i| (i != 42).then_some(i as f64)).collect();
    write_parquet(path, Arc::new(Int64Array::from(times)), cpu);
}

fn open(path: &Path) -> FileSource {
    FileSource::open(&DatasetConfig::new(path, vec!["cpu".into()])).unwrap()
}

fn assert_boundary_exact(source: &mut FileSource) {
    for t in timestamp(0)..=timestamp(ROWS - 1) {
        let row = (t - 1_000) / 50;
        let location = source.locate_record(t).unwrap();
        assert_eq!(location.offset, row as u64, "row for t={t}");
        assert_eq!(location.timestamp, timestamp(row), "timestamp for t={t}");
    }
}

#[test]
fn test_layout_from_row_groups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("series.parquet");
    millis_series(&path);

    let source = open(&path);
    let layout = source.layout();
    assert_eq!(layout.start_time, 1_000);
    assert_eq!(layout.end_time, timestamp(ROWS - 1));
    assert_eq!(layout.sampling_interval, 50);
    assert_eq!(layout.record_count_hint, ROWS as u64);
    assert_eq!(
        layout.addressing,
        Addressing::Partitions {
            records_per_partition: 10,
            partition_count: 10,
        }
    );
}

#[test]
fn test_locate_is_boundary_exact() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("series.parquet");
    millis_series(&path);

    let mut source = open(&path);
    assert_boundary_exact(&mut source);
}

#[test]
fn test_locate_survives_misestimated_partitions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("series.parquet");
    millis_series(&path);

    let mut source = open(&path);
    let sampled = *source.layout();
    for records_per_partition in [3, 40] {
        let mut layout = sampled;
        layout.addressing = Addressing::Partitions {
            records_per_partition,
            partition_count: 10,
        };
        source.set_layout(layout);
        assert_boundary_exact(&mut source);
    }
    assert!(source.correction_steps() > 0);
}

#[test]
fn test_materialize_projects_and_keeps_nulls() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("series.parquet");
    millis_series(&path);

    let mut source = open(&path);
    let records = source
        .materialize(TimeRange::new(1_230, 1_520).unwrap(), &[MeasureId(0)])
        .unwrap();
    let stamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
    assert_eq!(stamps, vec![1_250, 1_300, 1_350, 1_400, 1_450, 1_500]);
    assert_eq!(records[0].fields, vec!["1250".to_string(), "5".to_string()]);
    assert_eq!(records[0].offset, 5);

    let around_null = source
        .materialize(TimeRange::new(timestamp(41), timestamp(44)).unwrap(), &[MeasureId(0)])
        .unwrap();
    let values: Vec<&str> = around_null.iter().map(|r| r.fields[1].as_str()).collect();
    assert_eq!(values, vec!["41", "", "43"]);
}

#[test]
fn test_query_over_row_groups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("series.parquet");
    millis_series(&path);

    let mut source = open(&path);
    let query = M4Query::new(TimeRange::new(1_000, 2_000).unwrap(), 4, vec![MeasureId(0)]).unwrap();
    let points = run_file(&mut source, &query).unwrap().collect_all().unwrap();

    assert_eq!(points.len(), 4);
    for (i, point) in points.iter().enumerate() {
        let stats = point.get(MeasureId(0)).unwrap();
        let first_row = i as f64 * 5.0;
        assert_eq!(stats.count, 5);
        assert_eq!(stats.first, first_row);
        assert_eq!(stats.last, first_row + 4.0);
        assert_eq!((stats.min, stats.max), (first_row, first_row + 4.0));
    }
}

#[test]
fn test_microsecond_time_column() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("micros.parquet");
    let micros: Vec<i64> = (0..ROWS).map(|i| timestamp(i) * 1_000).collect();
    let cpu = (0..ROWS).map(|i| Some(i as f64)).collect();
    write_parquet(
        &path,
        Arc::new(TimestampMicrosecondArray::from(micros)),
        cpu,
    );

    let mut source = open(&path);
    assert_eq!(source.layout().start_time, 1_000);
    assert_boundary_exact(&mut source);
}

#[test]
fn test_text_time_column() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("text.parquet");
    let texts: Vec<String> = (0..ROWS)
        .map(|i| {
            let ms = timestamp(i);
            format!("1970-01-01T00:00:{:02}.{:03}Z", ms / 1_000, ms % 1_000)
        })
        .collect();
    let cpu = (0..ROWS).map(|i| Some(i as f64)).collect();
    write_parquet(&path, Arc::new(StringArray::from(texts)), cpu);

    let mut config = DatasetConfig::new(&path, vec!["cpu".into()]);
    config.time_format = TimeFormat::Rfc3339;
    let mut source = FileSource::open(&config).unwrap();
    assert_eq!(source.layout().end_time, timestamp(ROWS - 1));
    assert_boundary_exact(&mut source);
}

#[test]
fn test_null_timestamp_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("holes.parquet");
    let times: Vec<Option<i64>> = (0..20).map(|i| (i != 7).then_some(timestamp(i))).collect();
    let cpu = (0..20).map(|i| Some(i as f64)).collect();
    write_parquet(&path, Arc::new(Int64Array::from(times)), cpu);

    let mut source = open(&path);
    let result = source.materialize(TimeRange::new(1_000, 2_000).unwrap(), &[MeasureId(0)]);
    assert!(matches!(
        result,
        Err(FourfoldError::Access(AccessError::CorruptRecord { offset: 7, .. }))
    ));
}

#[test]
fn test_empty_and_misconfigured_files() {
    let dir = tempdir().unwrap();

    let empty = dir.path().join("empty.parquet");
    write_parquet(&empty, Arc::new(Int64Array::from(Vec::<i64>::new())), Vec::new());
    assert!(matches!(
        FileSource::open(&DatasetConfig::new(&empty, vec!["cpu".into()])),
        Err(FourfoldError::Access(AccessError::EmptySource { .. }))
    ));

    let path = dir.path().join("series.parquet");
    millis_series(&path);
    assert!(matches!(
        FileSource::open(&DatasetConfig::new(&path, vec!["disk".into()])),
        Err(FourfoldError::Access(AccessError::UnknownColumn { .. }))
    ));
}


/// Timestamps whose duplicate runs straddle and start row groups, with a
/// gap far wider than the sampled interval between them.
fn irregular_times() -> Vec<i64> {
    let mut times: Vec<i64> = (0..8).map(timestamp).collect();
    times.extend([1_400; 5]);
    times.extend((0..7).map(|i| 3_000 + i * 50));
    times.extend([3_350; 5]);
    times
}

fn irregular_series(path: &Path) -> Vec<i64> {
    let times = irregular_times();
    let cpu = (0..times.len()).map(|i| Some(i as f64)).collect();
    write_parquet(path, Arc::new(Int64Array::from(times.clone())), cpu);
    times
}

#[test]
fn test_duplicate_timestamps_at_range_start() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dupes.parquet");
    irregular_series(&path);

    let mut source = open(&path);
    let rows = |source: &mut FileSource, from, to| -> Vec<u64> {
        source
            .materialize(TimeRange::new(from, to).unwrap(), &[MeasureId(0)])
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect()
    };
    assert_eq!(rows(&mut source, 1_400, 3_000), vec![8, 9, 10, 11, 12]);
    assert_eq!(rows(&mut source, 1_400, 1_401), vec![8, 9, 10, 11, 12]);
    assert_eq!(rows(&mut source, 3_350, 4_000), vec![20, 21, 22, 23, 24]);
}

#[test]
fn test_irregular_series_has_no_gaps_or_duplicates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("irregular.parquet");
    let times = irregular_series(&path);
    let end = times[times.len() - 1];

    let mut source = open(&path);
    let sampled = *source.layout();
    for records_per_partition in [10, 3, 40] {
        let mut layout = sampled;
        layout.addressing = Addressing::Partitions {
            records_per_partition,
            partition_count: 3,
        };
        source.set_layout(layout);

        for t in times[0]..=end {
            let last = times.iter().rposition(|&ts| ts <= t).unwrap();
            let location = source.locate_record(t).unwrap();
            assert_eq!(location.offset, last as u64, "row for t={t}");
            assert_eq!(location.timestamp, times[last], "timestamp for t={t}");
        }

        for from in (times[0]..=end).step_by(25) {
            let offsets: Vec<u64> = source
                .materialize(TimeRange::new(from, end + 1).unwrap(), &[MeasureId(0)])
                .unwrap()
                .iter()
                .map(|r| r.offset)
                .collect();
            let expected: Vec<u64> = (0..times.len() as u64)
                .filter(|&row| times[row as usize] >= from)
                .collect();
            assert_eq!(offsets, expected, "scan from {from}");
        }
    }
}

#[test]
fn test_out_of_order_timestamp_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("unsorted.parquet");
    let times: Vec<i64> = (0..20)
        .map(|i| if i == 12 { timestamp(3) } else { timestamp(i) })
        .collect();
    let cpu = (0..20).map(|i| Some(i as f64)).collect();
    write_parquet(&path, Arc::new(Int64Array::from(times)), cpu);

    let mut source = open(&path);
    let result = source.materialize(TimeRange::new(1_000, 2_000).unwrap(), &[MeasureId(0)]);
    assert!(matches!(
        result,
        Err(FourfoldError::Access(AccessError::CorruptRecord { offset: 12, .. }))
    ));
}
