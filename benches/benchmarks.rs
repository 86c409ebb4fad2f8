mod datasets;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;

use quarry::encoding::BlockCompression;
use quarry::{
    create_segment, load, AggregationFunction, AggregationSpec, FilterNode, GroupBySpec, ImmutableSegment,
    InMemoryRecordReader, OrderBy, QueryExecutor, QueryRequest, ReadMode, SegmentGeneratorConfig, Value,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

fn generator_config(dir: &Path, compression: BlockCompression) -> SegmentGeneratorConfig {
    SegmentGeneratorConfig {
        segment_name: Some("bench".to_string()),
        inverted_index_columns: vec!["country".to_string(), "tags".to_string()],
        no_dictionary_columns: vec!["clicks".to_string()],
        raw_compression: compression,
        ..SegmentGeneratorConfig::new("bench", dir)
    }
}

fn build_fixture(dir: &Path, rows: usize) -> PathBuf {
    let data = datasets::generate_rows(datasets::DEFAULT_SEED, rows, 64, 16, 32, 4);
    let config = generator_config(dir, BlockCompression::Lz4);
    create_segment(config, InMemoryRecordReader::new(datasets::bench_schema(), data))
        .expect("build bench segment")
        .path
}

fn dir_bytes(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|rd| rd.flatten().filter_map(|e| e.metadata().ok()).map(|m| m.len()).sum())
        .unwrap_or(0)
}

fn bench_segment_build(c: &mut Criterion) {
    let rows = datasets::generate_rows(datasets::DEFAULT_SEED, 20_000, 64, 16, 32, 4);

    let mut group = c.benchmark_group("segment_build");
    group.sample_size(10);

    for (name, compression) in [
        ("raw_none", BlockCompression::None),
        ("raw_lz4", BlockCompression::Lz4),
        ("raw_zstd3", BlockCompression::Zstd { level: 3 }),
    ] {
        // report on-disk size once per variant
        let probe = TempDir::new().expect("tempdir");
        let outcome = create_segment(
            generator_config(probe.path(), compression),
            InMemoryRecordReader::new(datasets::bench_schema(), rows.clone()),
        )
        .expect("build");
        eprintln!("segment_build/{}: {} bytes", name, dir_bytes(&outcome.path));

        group.bench_function(format!("build_20k_{}", name), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().expect("tempdir");
                    let reader = InMemoryRecordReader::new(datasets::bench_schema(), rows.clone());
                    (dir, reader)
                },
                |(dir, reader)| {
                    let outcome = create_segment(generator_config(dir.path(), compression), reader).unwrap();
                    black_box(outcome.crc);
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let path = build_fixture(dir.path(), 100_000);

    let mut group = c.benchmark_group("load");
    for mode in [ReadMode::Heap, ReadMode::Mmap] {
        group.bench_function(format!("load_100k_{}", mode), |b| {
            b.iter(|| {
                let segment = load(black_box(&path), mode).unwrap();
                black_box(segment.total_docs());
            })
        });
    }
    group.finish();
}

fn query_cases() -> Vec<(&'static str, QueryRequest)> {
    let sum_clicks = AggregationSpec::new(AggregationFunction::Sum, "clicks");
    vec![
        ("count_all", QueryRequest::aggregate(vec![AggregationSpec::count()])),
        (
            "sum_inverted_filter",
            QueryRequest::aggregate(vec![sum_clicks.clone()]).with_filter(FilterNode::eq("country", "c007")),
        ),
        (
            "sum_scan_filter",
            QueryRequest::aggregate(vec![sum_clicks.clone()]).with_filter(FilterNode::eq("device", 3)),
        ),
        (
            "avg_sorted_range",
            QueryRequest::aggregate(vec![AggregationSpec::new(AggregationFunction::Avg, "cost")]).with_filter(
                FilterNode::between("day", Some(Value::Int(20)), Some(Value::Int(40))),
            ),
        ),
        (
            "group_by_country_device_top10",
            QueryRequest::aggregate(vec![sum_clicks.clone()]).with_group_by(GroupBySpec {
                columns: vec!["country".to_string(), "device".to_string()],
                order_by: Some(OrderBy {
                    aggregation_index: 0,
                    descending: true,
                }),
                limit: Some(10),
            }),
        ),
        (
            "group_by_tags_mv",
            QueryRequest::aggregate(vec![AggregationSpec::count(), sum_clicks]).with_group_by(GroupBySpec {
                columns: vec!["tags".to_string()],
                order_by: None,
                limit: None,
            }),
        ),
    ]
}

fn bench_query(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let path = build_fixture(dir.path(), 100_000);
    let executor = QueryExecutor::default();

    for mode in [ReadMode::Heap, ReadMode::Mmap] {
        let segment: Arc<ImmutableSegment> = load(&path, mode).expect("load");
        let segments = [segment];

        let mut group = c.benchmark_group(format!("query_{}", mode));
        for (name, request) in query_cases() {
            group.bench_function(name, |b| {
                b.iter(|| {
                    let result = executor.execute(black_box(&segments), black_box(&request)).unwrap();
                    black_box(result);
                })
            });
        }
        group.finish();
    }
}

fn bench_bitmap_cache(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let path = build_fixture(dir.path(), 100_000);
    let segment = load(&path, ReadMode::Mmap).expect("load");
    let source = segment.data_source("country").expect("country column");
    let inv = source.inverted_index().expect("inverted index");

    let mut group = c.benchmark_group("bitmap_cache");
    group.bench_function("hot_lookup", |b| {
        inv.get_doc_ids(7).unwrap();
        b.iter(|| black_box(inv.get_doc_ids(black_box(7)).unwrap()))
    });
    group.bench_function("cold_lookup", |b| {
        b.iter(|| {
            inv.clear_cache().unwrap();
            black_box(inv.get_doc_ids(black_box(7)).unwrap())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_segment_build,
    bench_load,
    bench_query,
    bench_bitmap_cache
);
criterion_main!(benches);
