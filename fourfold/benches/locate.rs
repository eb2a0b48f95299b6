//! Benchmarks for timestamp lookups and file queries.
//!
//! Measures interpolation search against accurate and skewed layouts, and a
//! full M4 query over a CSV file.
//!
//! Run with: `cargo bench -p fourfold -- locate`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::io::{BufWriter, Write};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fourfold::layout::Addressing;
use fourfold::query::run_file;
use fourfold::{DatasetConfig, FileSource, M4Query, MeasureId, TimeIndexed, TimeRange};
use tempfile::tempdir;

const RECORDS: i64 = 200_000;
const INTERVAL: i64 = 100;

/// Writes a regularly sampled two-measure CSV file.
fn setup_source(dir: &tempfile::TempDir) -> FileSource {
    let path = dir.path().join("bench.csv");
    let mut file = BufWriter::new(std::fs::File::create(&path).unwrap());
    writeln!(file, "time,cpu,mem").unwrap();
    for i in 0..RECORDS {
        writeln!(file, "{},{},{}", i * INTERVAL, i % 97, (i * 7) % 1_013).unwrap();
    }
    file.flush().unwrap();
    drop(file);

    FileSource::open(&DatasetConfig::new(path, vec!["cpu".into(), "mem".into()])).unwrap()
}

fn bench_locate(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut source = setup_source(&dir);
    let accurate = *source.layout();

    let mut group = c.benchmark_group("locate");
    for skew in [1.0_f64, 1.25, 1.5] {
        let mut layout = accurate;
        if let Addressing::Bytes {
            mean_record_bytes, ..
        } = &mut layout.addressing
        {
            *mean_record_bytes *= skew;
        }
        source.set_layout(layout);

        let mut t = 0;
        group.bench_with_input(BenchmarkId::new("mean_skew", skew), &skew, |b, _| {
            b.iter(|| {
                t = (t + 7_919 * INTERVAL + 37) % (RECORDS * INTERVAL);
                black_box(source.locate(black_box(t)).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut source = setup_source(&dir);

    let mut group = c.benchmark_group("query");
    for span in [10_000_i64, 1_000_000] {
        let query = M4Query::new(
            TimeRange::new(5_000_000, 5_000_000 + span).unwrap(),
            100,
            vec![MeasureId(0), MeasureId(1)],
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::new("m4_csv", span), &query, |b, query| {
            b.iter(|| {
                let points = run_file(&mut source, query).unwrap().collect_all().unwrap();
                black_box(points.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_locate, bench_query);
criterion_main!(benches);
