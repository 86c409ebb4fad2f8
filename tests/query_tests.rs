//! End-to-end queries: read-mode equivalence, aggregation values and multi-segment combine.

mod common;

use std::sync::Arc;

use quarry::{
    execute_segment, AggregationFunction as F, AggregationSpec, FilterNode, FinalValue, GroupBySpec, OrderBy,
    QueryConfig, QueryExecutor, QueryRequest, QuarryError, ReducedResult, Value,
};

fn spec(f: F, column: &str) -> AggregationSpec {
    AggregationSpec::new(f, column)
}

fn values(result: &ReducedResult) -> Vec<FinalValue> {
    result.aggregation.iter().map(|a| a.value).collect()
}

fn requests() -> Vec<QueryRequest> {
    vec![
        QueryRequest::aggregate(vec![AggregationSpec::count(), spec(F::Sum, "clicks"), spec(F::Avg, "cost")]),
        QueryRequest::aggregate(vec![spec(F::DistinctCountMv, "tags"), spec(F::CountMv, "tags")])
            .with_filter(FilterNode::eq("country", "de")),
        QueryRequest::aggregate(vec![spec(F::Max, "cost"), spec(F::Min, "clicks")]).with_group_by(GroupBySpec {
            columns: vec!["country".to_string(), "tags".to_string()],
            order_by: Some(OrderBy {
                aggregation_index: 0,
                descending: true,
            }),
            limit: Some(7),
        }),
    ]
}

#[test]
fn heap_and_mmap_answer_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(97));
    let (heap, mmap) = common::load_both(&path);
    let executor = QueryExecutor::default();
    for request in requests() {
        let a = executor.execute(&[Arc::clone(&heap)], &request).unwrap();
        let b = executor.execute(&[Arc::clone(&mmap)], &request).unwrap();
        assert_eq!(a, b, "request {:?}", request);
    }
}

#[test]
fn aggregations_over_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(40));
    let (segment, _) = common::load_both(&path);

    let request = QueryRequest::aggregate(vec![
        AggregationSpec::count(),
        spec(F::Sum, "clicks"),
        spec(F::Min, "cost"),
        spec(F::Max, "cost"),
        spec(F::Avg, "clicks"),
        spec(F::MinMaxRange, "day"),
        spec(F::DistinctCount, "country"),
        spec(F::CountMv, "tags"),
        spec(F::DistinctCountMv, "tags"),
    ]);
    let result = QueryExecutor::default().execute(&[segment], &request).unwrap();
    assert_eq!(
        values(&result),
        vec![
            FinalValue::Long(40),
            FinalValue::Double(780.0),
            FinalValue::Double(0.0),
            FinalValue::Double(19.5),
            FinalValue::Double(19.5),
            FinalValue::Double(3.0),
            FinalValue::Long(4),
            FinalValue::Long(79),
            FinalValue::Long(3),
        ]
    );
    assert_eq!(result.aggregation[1].label, "sum(clicks)");
    assert_eq!(result.stats.segments_processed, 1);
    assert_eq!(result.stats.docs_scanned, 40);
}

#[test]
fn filtered_aggregation_with_no_matches() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(20));
    let (segment, _) = common::load_both(&path);

    let request = QueryRequest::aggregate(vec![AggregationSpec::count(), spec(F::Max, "cost"), spec(F::Sum, "cost")])
        .with_filter(FilterNode::eq("country", "nowhere"));
    let result = QueryExecutor::default().execute(&[segment], &request).unwrap();
    assert_eq!(
        values(&result),
        vec![FinalValue::Long(0), FinalValue::Null, FinalValue::Double(0.0)]
    );
    assert_eq!(result.stats.docs_scanned, 0);
}

#[test]
fn segments_combine_like_one() {
    let dir = tempfile::tempdir().unwrap();
    let rows = common::events_rows(80);
    let whole = common::build_events_segment(dir.path(), "whole", rows.clone());
    let first = common::build_events_segment(dir.path(), "first", rows[..33].to_vec());
    let second = common::build_events_segment(dir.path(), "second", rows[33..].to_vec());

    let (whole, _) = common::load_both(&whole);
    let (_, first) = common::load_both(&first);
    let (second, _) = common::load_both(&second);

    let executor = QueryExecutor::new(QueryConfig {
        max_docs_per_block: 7,
        ..QueryConfig::default()
    });
    for request in requests() {
        let one = executor.execute(&[Arc::clone(&whole)], &request).unwrap();
        let two = executor
            .execute(&[Arc::clone(&first), Arc::clone(&second)], &request)
            .unwrap();
        assert_eq!(one.aggregation, two.aggregation, "request {:?}", request);
        assert_eq!(one.group_by, two.group_by, "request {:?}", request);
        assert_eq!(two.stats.segments_processed, 2);
        assert_eq!(one.stats.docs_scanned, two.stats.docs_scanned);
    }
}

#[test]
fn group_by_orders_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(40));
    let (segment, _) = common::load_both(&path);
    let executor = QueryExecutor::default();

    let by_device = |order_by: Option<OrderBy>, limit: Option<usize>| {
        QueryRequest::aggregate(vec![AggregationSpec::count(), spec(F::Sum, "clicks")]).with_group_by(GroupBySpec {
            columns: vec!["device".to_string()],
            order_by,
            limit,
        })
    };

    // device d holds clicks i with i % 3 == d: counts 14, 13, 13; sums 273, 247, 260
    let unordered = executor.execute(&[Arc::clone(&segment)], &by_device(None, None)).unwrap();
    let keys: Vec<Value> = unordered.group_by.iter().map(|r| r.key[0].clone()).collect();
    assert_eq!(keys, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    assert_eq!(unordered.group_by[0].values, vec![FinalValue::Long(14), FinalValue::Double(273.0)]);

    let ascending = OrderBy {
        aggregation_index: 1,
        descending: false,
    };
    let top = executor
        .execute(&[Arc::clone(&segment)], &by_device(Some(ascending), Some(2)))
        .unwrap();
    let keys: Vec<Value> = top.group_by.iter().map(|r| r.key[0].clone()).collect();
    assert_eq!(keys, vec![Value::Int(1), Value::Int(2)]);

    // count ties between devices 1 and 2 resolve by key
    let by_count = OrderBy {
        aggregation_index: 0,
        descending: true,
    };
    let tied = executor
        .execute(&[Arc::clone(&segment)], &by_device(Some(by_count), None))
        .unwrap();
    let keys: Vec<Value> = tied.group_by.iter().map(|r| r.key[0].clone()).collect();
    assert_eq!(keys, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
}

#[test]
fn per_segment_results_are_partials() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(10));
    let (segment, _) = common::load_both(&path);

    let request = QueryRequest::aggregate(vec![spec(F::Avg, "clicks")]);
    let partial = execute_segment(&segment, &request, &QueryConfig::default()).unwrap();
    assert_eq!(partial.stats().docs_scanned, 10);
    match partial {
        quarry::query::SegmentResult::Aggregation { partials, .. } => {
            assert_eq!(partials, vec![quarry::IntermediateResult::Avg { sum: 45.0, count: 10 }]);
        }
        other => panic!("expected aggregation partials, got {:?}", other),
    }
}

#[test]
fn bad_requests_fail_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(10));
    let (segment, _) = common::load_both(&path);
    let executor = QueryExecutor::default();

    let cases = vec![
        QueryRequest::aggregate(Vec::new()),
        // string column for a numeric function
        QueryRequest::aggregate(vec![spec(F::Sum, "country")]),
        // multi-value function over a single-value column
        QueryRequest::aggregate(vec![spec(F::SumMv, "clicks")]),
        // single-value function over a multi-value column
        QueryRequest::aggregate(vec![spec(F::DistinctCount, "tags")]),
        QueryRequest::aggregate(vec![spec(F::Max, "missing")]),
    ];
    for request in cases {
        match executor.execute(&[Arc::clone(&segment)], &request) {
            Err(QuarryError::InvalidQuery(_)) => {}
            other => panic!("expected InvalidQuery for {:?}, got {:?}", request, other),
        }
    }
}

#[test]
fn request_round_trips_through_json() {
    let json = r#"{
        "filter": {"or": [
            {"predicate": {"column": "country", "predicate": {"eq": {"string": "us"}}}},
            {"predicate": {"column": "day", "predicate": {"range": {"lower": {"int": 102}, "lower_inclusive": false}}}}
        ]},
        "aggregations": [{"function": "count"}, {"function": "summv", "column": "tags"}],
        "group_by": {"columns": ["country"], "limit": 2}
    }"#;
    let request: QueryRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.aggregations[1].function, F::SumMv);
    let back: QueryRequest = serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
    assert_eq!(back, request);
}
