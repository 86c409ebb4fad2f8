#![cfg(feature = "prometheus")]

mod common;

use std::sync::OnceLock;
use std::time::Duration;

use quarry::telemetry::quarry_metrics::InProcessPrometheus;
use quarry::{AggregationFunction, AggregationSpec, FilterNode, GroupBySpec, QueryConfig, QueryExecutor, QueryRequest};

fn install_prometheus_once() -> &'static InProcessPrometheus {
    static PROM: OnceLock<InProcessPrometheus> = OnceLock::new();
    PROM.get_or_init(|| {
        InProcessPrometheus::install(Duration::from_millis(25))
            .expect("failed to install in-process prometheus recorder")
    })
}

fn parse_sample(rendered: &str, metric: &str) -> Option<f64> {
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?;
        // Support exact match and label form: `name{...} value`.
        if key == metric || key.starts_with(metric) && key.as_bytes().get(metric.len()).copied() == Some(b'{') {
            if let Ok(v) = val.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn parse_counter(rendered: &str, base_name: &str) -> f64 {
    parse_sample(rendered, &format!("{}_total", base_name))
        .or_else(|| parse_sample(rendered, base_name))
        .unwrap_or(0.0)
}

fn extract_quarry_lines(rendered: &str) -> String {
    rendered
        .lines()
        .filter(|l| l.contains("quarry_"))
        .take(200)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn emits_build_load_cache_and_query_metrics() {
    let prom = install_prometheus_once();

    let before = prom.render();
    let before_built = parse_counter(&before, "quarry_segments_built");
    let before_rows = parse_counter(&before, "quarry_rows_indexed");
    let before_loaded = parse_counter(&before, "quarry_segments_loaded");
    let before_misses = parse_counter(&before, "quarry_bitmap_cache_misses");
    let before_hits = parse_counter(&before, "quarry_bitmap_cache_hits");
    let before_scanned = parse_counter(&before, "quarry_docs_scanned");
    let before_trimmed = parse_counter(&before, "quarry_groups_trimmed");
    let before_queries = parse_sample(&before, "quarry_query_duration_seconds_count").unwrap_or(0.0);

    let dir = tempfile::tempdir().expect("tempdir");
    let rows = 50u32;
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(rows));
    let (segment, _) = common::load_both(&path);

    let filtered = QueryRequest::aggregate(vec![AggregationSpec::count()]).with_filter(FilterNode::eq("country", "us"));
    let executor = QueryExecutor::default();
    executor.execute(&[segment.clone()], &filtered).expect("first query");
    executor.execute(&[segment.clone()], &filtered).expect("second query");

    let small = QueryExecutor::new(QueryConfig {
        num_groups_limit: 2,
        ..QueryConfig::default()
    });
    let grouped = QueryRequest::aggregate(vec![AggregationSpec::new(AggregationFunction::Sum, "clicks")])
        .with_group_by(GroupBySpec {
            columns: vec!["country".to_string()],
            order_by: None,
            limit: None,
        });
    small.execute(&[segment], &grouped).expect("group-by query");

    // Give the exporter time to run upkeep at least once.
    std::thread::sleep(Duration::from_millis(60));

    let after = prom.render();
    let after_built = parse_counter(&after, "quarry_segments_built");
    let after_rows = parse_counter(&after, "quarry_rows_indexed");
    let after_loaded = parse_counter(&after, "quarry_segments_loaded");
    let after_misses = parse_counter(&after, "quarry_bitmap_cache_misses");
    let after_hits = parse_counter(&after, "quarry_bitmap_cache_hits");
    let after_scanned = parse_counter(&after, "quarry_docs_scanned");
    let after_trimmed = parse_counter(&after, "quarry_groups_trimmed");
    let after_queries = parse_sample(&after, "quarry_query_duration_seconds_count").unwrap_or(0.0);

    assert!(
        after_built >= before_built + 1.0,
        "expected segments built to increase, before={}, after={}\n\nRendered quarry_* metrics:\n{}",
        before_built,
        after_built,
        extract_quarry_lines(&after)
    );
    assert!(
        after_rows >= before_rows + rows as f64,
        "expected rows indexed to increase by at least {}, before={}, after={}",
        rows,
        before_rows,
        after_rows
    );
    assert!(
        after_loaded >= before_loaded + 2.0,
        "expected two loads, before={}, after={}",
        before_loaded,
        after_loaded
    );
    assert!(after_misses >= before_misses + 1.0, "expected a bitmap cache miss");
    assert!(after_hits >= before_hits + 1.0, "expected a bitmap cache hit on the repeated query");
    assert!(
        after_scanned >= before_scanned + 2.0 * 12.0 + rows as f64,
        "expected docs scanned to cover every query, before={}, after={}",
        before_scanned,
        after_scanned
    );
    assert!(
        after_trimmed >= before_trimmed + 2.0,
        "expected the combine table to trim 4 groups to 2, before={}, after={}",
        before_trimmed,
        after_trimmed
    );
    assert!(
        after_queries >= before_queries + 3.0,
        "expected query duration histogram count to increase by 3, before={}, after={}",
        before_queries,
        after_queries
    );
}
