//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use quarry::{
    create_segment, load, DataType, GenericRow, ImmutableSegment, InMemoryRecordReader, ReadMode, Schema,
    SegmentGeneratorConfig,
};

/// `events` schema: country (SV string), tags (MV string), device (SV int), clicks (SV long),
/// cost (SV double), day (time, int).
pub fn events_schema() -> Schema {
    Schema::new()
        .with_dimension("country", DataType::String)
        .with_multi_value_dimension("tags", DataType::String)
        .with_dimension("device", DataType::Int)
        .with_metric("clicks", DataType::Long)
        .with_metric("cost", DataType::Double)
        .with_time("day", DataType::Int)
}

const COUNTRIES: [&str; 4] = ["ca", "de", "fr", "us"];
const TAGS: [&str; 3] = ["a", "b", "c"];

/// Deterministic rows: row `i` has country `COUNTRIES[i % 4]`, device `i % 3`, clicks `i`,
/// cost `i / 2`, day `100 + i / 10`, and tags `TAGS[0..=(i % 3)]`.
pub fn events_rows(n: u32) -> Vec<GenericRow> {
    (0..n)
        .map(|i| {
            GenericRow::new()
                .with_single("country", COUNTRIES[(i % 4) as usize])
                .with_multi("tags", TAGS[..=(i % 3) as usize].iter().copied())
                .with_single("device", (i % 3) as i32)
                .with_single("clicks", i as i64)
                .with_single("cost", i as f64 / 2.0)
                .with_single("day", 100 + (i / 10) as i32)
        })
        .collect()
}

/// Builds a segment under `dir` with inverted indexes on country and tags, clicks stored raw.
pub fn build_events_segment(dir: &Path, name: &str, rows: Vec<GenericRow>) -> std::path::PathBuf {
    let config = SegmentGeneratorConfig {
        segment_name: Some(name.to_string()),
        inverted_index_columns: vec!["country".to_string(), "tags".to_string()],
        no_dictionary_columns: vec!["clicks".to_string()],
        ..SegmentGeneratorConfig::new("events", dir)
    };
    create_segment(config, InMemoryRecordReader::new(events_schema(), rows))
        .expect("build segment")
        .path
}

pub fn load_both(path: &Path) -> (Arc<ImmutableSegment>, Arc<ImmutableSegment>) {
    (
        load(path, ReadMode::Heap).expect("heap load"),
        load(path, ReadMode::Mmap).expect("mmap load"),
    )
}
