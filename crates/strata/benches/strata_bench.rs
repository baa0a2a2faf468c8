//! Benchmarks for Strata components.
//!
//! Run with: cargo bench --package alopex-strata
//!
//! ## Benchmark Categories
//!
//! - **Block Codec**: Encode/decode of a full block
//! - **Query**: Windowed scans over the primary and a secondary bucket

use std::io::Cursor;

use alopex_strata::codec::{encode_block, BlockDecoder, Transform};
use alopex_strata::downsample::FunctionKind;
use alopex_strata::schema::{ColumnSchema, SeriesSchema, Tags};
use alopex_strata::{ColumnRequest, Series};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Regular ten second samples with a slowly varying value.
fn generate_columns(count: usize, value_columns: usize) -> (Vec<i64>, Vec<Vec<u64>>) {
    let times: Vec<i64> = (0..count as i64).map(|i| 1_700_000_000 + i * 10).collect();
    let mut columns = vec![Transform::TIME.apply(&times)];
    for c in 0..value_columns {
        let values: Vec<i64> = (0..count)
            .map(|i| 5_000 + ((i as f64 * 0.1 + c as f64).sin() * 300.0) as i64)
            .collect();
        columns.push(Transform::DELTA.apply(&values));
    }
    (times, columns)
}

fn bench_block_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_encode");

    for width in [1usize, 4, 16].iter() {
        let (times, columns) = generate_columns(20_000, *width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &columns, |b, columns| {
            b.iter(|| encode_block(black_box(&times), black_box(columns)))
        });
    }

    group.finish();
}

fn bench_block_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_decode");

    for width in [1usize, 4, 16].iter() {
        let (times, columns) = generate_columns(20_000, *width);
        let block = match encode_block(&times, &columns) {
            Ok(block) => block,
            Err(e) => panic!("encode failed: {}", e),
        };
        group.throughput(Throughput::Elements((block.points * (width + 1)) as u64));
        let need = vec![true; width + 1];
        group.bench_with_input(BenchmarkId::from_parameter(width), &block.bytes, |b, bytes| {
            b.iter(|| {
                let mut decoder = BlockDecoder::with_reader(Cursor::new(bytes.clone()));
                let _ = decoder.decode_header();
                decoder.decode_block(&need)
            })
        });
    }

    group.finish();
}

fn populated_series(dir: &TempDir, points: i64) -> Series {
    let mut cpu = Tags::new();
    cpu.insert("name".into(), "cpu".into());
    let schema = SeriesSchema::new(Tags::new(), vec![10, 6], vec![ColumnSchema::new(cpu)]);
    let mut series = Series::create(dir.path().join("bench"), schema).unwrap();
    for i in 0..points {
        series
            .insert_values(i * 10, &[(0, 5_000 + (i % 97))])
            .unwrap();
        if i % 4_096 == 0 {
            series.flush(false).unwrap();
        }
    }
    series.flush(true).unwrap();
    series
}

fn bench_query(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let points = 100_000;
    let series = populated_series(&dir, points);
    let end = points * 10 - 1;
    let mean = [ColumnRequest::new(0, FunctionKind::from_name("mean").unwrap())];

    let mut group = c.benchmark_group("query_scan");
    group.throughput(Throughput::Elements(points as u64));

    group.bench_function("primary_step_10", |b| {
        b.iter(|| series.query(&mean, 0, end, 10).unwrap().collect_all())
    });

    group.bench_function("secondary_step_3600", |b| {
        b.iter(|| series.query(&mean, 0, end, 3_600).unwrap().collect_all())
    });

    group.finish();
}

criterion_group!(codec_benches, bench_block_encode, bench_block_decode);
criterion_group!(query_benches, bench_query);
criterion_main!(codec_benches, query_benches);
