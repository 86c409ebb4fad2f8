//! Group-by keys, multi-value cross products and bounded group tables.

mod common;

use std::path::Path;
use std::sync::Arc;

use quarry::groupby::{GroupByExecutor, GroupByResultHolder, GroupKeyGenerator, GroupKeyKind, TrimPolicy};
use quarry::{
    create_segment, load, AggregationFunction, AggregationSpec, DataType, FinalValue, GenericRow, GroupBySpec,
    ImmutableSegment, InMemoryRecordReader, IntermediateResult, OrderBy, QueryConfig, QueryExecutor, QueryRequest,
    QuarryError, ReadMode, Schema, SegmentGeneratorConfig, Value,
};

fn build(dir: &Path, schema: Schema, rows: Vec<GenericRow>) -> Arc<ImmutableSegment> {
    let config = SegmentGeneratorConfig {
        segment_name: Some("g".to_string()),
        ..SegmentGeneratorConfig::new("t", dir)
    };
    let outcome = create_segment(config, InMemoryRecordReader::new(schema, rows)).unwrap();
    load(&outcome.path, ReadMode::Mmap).unwrap()
}

fn cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn small_cardinalities_pack_into_one_word() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema::new()
        .with_dimension("a", DataType::Int)
        .with_dimension("b", DataType::Int);
    let rows = (0..1000i32)
        .map(|i| GenericRow::new().with_single("a", i % 10).with_single("b", i))
        .collect();
    let segment = build(dir.path(), schema, rows);

    let keys = GroupKeyGenerator::new(&segment, &cols(&["a", "b"])).unwrap();
    assert_eq!(keys.total_bits(), 16);
    assert_eq!(keys.kind(), GroupKeyKind::Packed);

    // every generated key decodes back to the doc's own values
    let docs: Vec<u32> = (0..1000).step_by(37).collect();
    let mut seen = Vec::new();
    keys.for_each_key(&docs, |i, key| {
        seen.push((docs[i], keys.decode(&key)?));
        Ok(())
    })
    .unwrap();
    assert_eq!(seen.len(), docs.len());
    for (doc, values) in seen {
        assert_eq!(values, vec![Value::Int(doc as i32 % 10), Value::Int(doc as i32)]);
    }
}

#[test]
fn wide_keys_fall_back_to_composite() {
    let dir = tempfile::tempdir().unwrap();
    let names = ["c0", "c1", "c2", "c3", "c4", "c5"];
    let schema = names
        .iter()
        .fold(Schema::new(), |s, n| s.with_dimension(n, DataType::Int));
    let rows = (0..1000i32)
        .map(|i| names.iter().fold(GenericRow::new(), |r, n| r.with_single(n, i)))
        .collect();
    let segment = build(dir.path(), schema, rows);

    let keys = GroupKeyGenerator::new(&segment, &cols(&names)).unwrap();
    assert_eq!(keys.total_bits(), 66);
    assert_eq!(keys.kind(), GroupKeyKind::Composite);

    let request = QueryRequest::aggregate(vec![AggregationSpec::count()]).with_group_by(GroupBySpec {
        columns: cols(&names),
        order_by: None,
        limit: Some(3),
    });
    let result = QueryExecutor::default().execute(&[segment], &request).unwrap();
    assert_eq!(result.group_by.len(), 3);
    for (i, row) in result.group_by.iter().enumerate() {
        assert_eq!(row.key, vec![Value::Int(i as i32); 6]);
        assert_eq!(row.values, vec![FinalValue::Long(1)]);
    }
}

#[test]
fn multi_value_columns_group_by_cross_product() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema::new()
        .with_multi_value_dimension("x", DataType::String)
        .with_multi_value_dimension("y", DataType::Int)
        .with_metric("m", DataType::Long);
    let rows = vec![
        GenericRow::new()
            .with_multi("x", ["a", "b"])
            .with_multi("y", [1i32, 2, 3])
            .with_single("m", 10i64),
        GenericRow::new()
            .with_multi("x", ["a"])
            .with_multi("y", [1i32])
            .with_single("m", 1i64),
        GenericRow::new()
            .with_multi("x", ["b"])
            .with_multi("y", [3i32])
            .with_single("m", 100i64),
    ];
    let segment = build(dir.path(), schema, rows);

    let mut executor = GroupByExecutor::new(
        &segment,
        &cols(&["x", "y"]),
        &[AggregationSpec::count(), AggregationSpec::new(AggregationFunction::Sum, "m")],
        100,
        None,
    )
    .unwrap();
    executor.process_block(&[0, 1, 2]).unwrap();
    assert_eq!(executor.docs_scanned(), 3);
    let mut groups = executor.finish().unwrap();
    groups.sort_by(|a, b| a.0.cmp(&b.0));

    let key = |x: &str, y: i32| vec![Value::String(x.to_string()), Value::Int(y)];
    let got: Vec<(Vec<Value>, FinalValue, FinalValue)> = groups
        .iter()
        .map(|(k, p)| (k.clone(), p[0].finalize(), p[1].finalize()))
        .collect();
    assert_eq!(
        got,
        vec![
            (key("a", 1), FinalValue::Long(2), FinalValue::Double(11.0)),
            (key("a", 2), FinalValue::Long(1), FinalValue::Double(10.0)),
            (key("a", 3), FinalValue::Long(1), FinalValue::Double(10.0)),
            (key("b", 1), FinalValue::Long(1), FinalValue::Double(10.0)),
            (key("b", 2), FinalValue::Long(1), FinalValue::Double(10.0)),
            (key("b", 3), FinalValue::Long(2), FinalValue::Double(110.0)),
        ]
    );
}

#[test]
fn raw_columns_cannot_be_grouped() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(10));
    let (segment, _) = common::load_both(&path);
    for columns in [cols(&["clicks"]), cols(&["nope"]), Vec::new()] {
        match GroupKeyGenerator::new(&segment, &columns) {
            Err(QuarryError::InvalidQuery(_)) => {}
            other => panic!("expected InvalidQuery for {:?}, got {:?}", columns, other.map(|g| g.kind())),
        }
    }
}

#[test]
fn holder_trims_to_the_best_groups() {
    let order = OrderBy {
        aggregation_index: 0,
        descending: true,
    };
    for policy in [TrimPolicy::RetainBest { buffer: 6 }, TrimPolicy::EvictWorst { buffer: 6 }] {
        let mut holder: GroupByResultHolder<u32> =
            GroupByResultHolder::with_policy(vec![AggregationFunction::Sum], 3, Some(order), policy);
        // ascending scores, so every trim has to drop early groups
        for key in 0..20u32 {
            holder.merge(key, vec![IntermediateResult::Sum(key as f64)]).unwrap();
            assert!(holder.len() <= 6, "{:?} grew to {}", policy, holder.len());
        }
        holder.trim();
        let mut kept: Vec<u32> = holder.into_groups().into_iter().map(|(k, _)| k).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![17, 18, 19], "{:?}", policy);
    }
}

#[test]
fn combine_table_respects_the_group_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::build_events_segment(dir.path(), "seg", common::events_rows(40));
    let (segment, _) = common::load_both(&path);

    let executor = QueryExecutor::new(QueryConfig {
        num_groups_limit: 3,
        ..QueryConfig::default()
    });
    let request = QueryRequest::aggregate(vec![AggregationSpec::new(AggregationFunction::Sum, "clicks")])
        .with_group_by(GroupBySpec {
            columns: cols(&["country"]),
            order_by: Some(OrderBy {
                aggregation_index: 0,
                descending: true,
            }),
            limit: None,
        });
    let result = executor.execute(&[segment], &request).unwrap();
    let keys: Vec<&Value> = result.group_by.iter().map(|r| &r.key[0]).collect();
    assert_eq!(
        keys,
        vec![
            &Value::String("us".into()),
            &Value::String("fr".into()),
            &Value::String("de".into())
        ]
    );
    assert_eq!(result.group_by[0].values, vec![FinalValue::Double(210.0)]);
    assert_eq!(result.stats.groups_trimmed, 1);
}
