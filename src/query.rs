use crate::aggregation::{AggregationExecutor, AggregationFunction, AggregationSpec, FinalValue, IntermediateResult};
use crate::block::{Block, DocIdSource, Operator};
use crate::error::QuarryError;
use crate::filter::{build_filter_operator, DocIdSetOperator, FilterNode, DEFAULT_MAX_DOCS_PER_BLOCK};
use crate::groupby::{GroupByExecutor, GroupByResultHolder, OrderBy, SMALL_CAPACITY_LIMIT};
use crate::loader::ImmutableSegment;
use crate::telemetry::{noop_event_listener, quarry_metrics, SegmentEvent, SegmentEventListener};
use crate::types::Value;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Groups returned when a group-by request sets no limit.
pub const DEFAULT_GROUP_LIMIT: usize = 10;

/// Group-by part of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBySpec {
    pub columns: Vec<String>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A logical query. Deserializes from JSON, e.g.
/// `{"filter": {"predicate": {"column": "country", "predicate": {"eq": {"string": "us"}}}},
///   "aggregations": [{"function": "sum", "column": "clicks"}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filter: Option<FilterNode>,
    pub aggregations: Vec<AggregationSpec>,
    #[serde(default)]
    pub group_by: Option<GroupBySpec>,
}

impl QueryRequest {
    pub fn aggregate(aggregations: Vec<AggregationSpec>) -> Self {
        Self {
            filter: None,
            aggregations,
            group_by: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_group_by(mut self, group_by: GroupBySpec) -> Self {
        self.group_by = Some(group_by);
        self
    }

    fn functions(&self) -> Vec<AggregationFunction> {
        self.aggregations.iter().map(|a| a.function).collect()
    }

    /// Shape checks that need no segment.
    pub fn validate(&self) -> Result<(), QuarryError> {
        if self.aggregations.is_empty() {
            return Err(QuarryError::InvalidQuery("no aggregations requested".to_string()));
        }
        if let Some(group_by) = &self.group_by {
            if group_by.columns.is_empty() {
                return Err(QuarryError::InvalidQuery("group-by needs at least one column".to_string()));
            }
            if let Some(order) = group_by.order_by {
                if order.aggregation_index >= self.aggregations.len() {
                    return Err(QuarryError::InvalidQuery(format!(
                        "order-by aggregation index {} out of range for {} aggregations",
                        order.aggregation_index,
                        self.aggregations.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Execution tunables.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Upper bound on doc ids handed to an aggregation at once.
    pub max_docs_per_block: usize,
    /// Group capacity per segment and in the combine table.
    pub num_groups_limit: usize,
    pub event_listener: Arc<dyn SegmentEventListener>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_docs_per_block: DEFAULT_MAX_DOCS_PER_BLOCK,
            num_groups_limit: SMALL_CAPACITY_LIMIT,
            event_listener: noop_event_listener(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub segments_processed: usize,
    pub docs_scanned: u64,
    pub entries_scanned: u64,
    pub groups_trimmed: u64,
}

impl ExecutionStats {
    fn add(&mut self, other: &ExecutionStats) {
        self.segments_processed += other.segments_processed;
        self.docs_scanned += other.docs_scanned;
        self.entries_scanned += other.entries_scanned;
        self.groups_trimmed += other.groups_trimmed;
    }
}

/// Mergeable output of one segment.
#[derive(Debug, Clone)]
pub enum SegmentResult {
    Aggregation {
        partials: Vec<IntermediateResult>,
        stats: ExecutionStats,
    },
    GroupBy {
        groups: Vec<(Vec<Value>, Vec<IntermediateResult>)>,
        stats: ExecutionStats,
    },
}

impl SegmentResult {
    pub fn stats(&self) -> &ExecutionStats {
        match self {
            SegmentResult::Aggregation { stats, .. } | SegmentResult::GroupBy { stats, .. } => stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub label: String,
    pub value: FinalValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub key: Vec<Value>,
    pub values: Vec<FinalValue>,
}

/// Final answer of a query across segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedResult {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub aggregation: Vec<AggregationResult>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub group_by: Vec<GroupRow>,
    pub stats: ExecutionStats,
}

/// Replaces `out` with the doc ids of a `DocIds` block.
#[inline]
fn collect_docs(block: &Block, out: &mut Vec<u32>) {
    out.clear();
    if let Some(set) = block.doc_id_set() {
        out.extend(set.iter());
    }
}

/// Runs `request` against one segment.
///
/// The filter tree produces one doc id set, chunked into blocks of at most
/// `config.max_docs_per_block` ids; each block feeds either the plain aggregation or the
/// group-by executor.
pub fn execute_segment(
    segment: &ImmutableSegment,
    request: &QueryRequest,
    config: &QueryConfig,
) -> Result<SegmentResult, QuarryError> {
    request.validate()?;

    let filter = build_filter_operator(segment, request.filter.as_ref())?;
    let mut docs = DocIdSetOperator::new(filter, config.max_docs_per_block);
    let mut buf = Vec::with_capacity(config.max_docs_per_block.min(segment.total_docs() as usize));

    match &request.group_by {
        None => {
            let mut executor = AggregationExecutor::new(&request.aggregations, segment)?;
            docs.open()?;
            while let Some(block) = docs.next_block()? {
                collect_docs(&block, &mut buf);
                executor.aggregate_block(&buf)?;
            }
            docs.close()?;
            let stats = ExecutionStats {
                segments_processed: 1,
                docs_scanned: executor.docs_scanned(),
                entries_scanned: executor.entries_scanned(),
                groups_trimmed: 0,
            };
            Ok(SegmentResult::Aggregation {
                partials: executor.finish().into_results(),
                stats,
            })
        }
        Some(group_by) => {
            let mut executor = GroupByExecutor::new(
                segment,
                &group_by.columns,
                &request.aggregations,
                config.num_groups_limit,
                group_by.order_by,
            )?;
            docs.open()?;
            while let Some(block) = docs.next_block()? {
                collect_docs(&block, &mut buf);
                executor.process_block(&buf)?;
            }
            docs.close()?;
            let stats = ExecutionStats {
                segments_processed: 1,
                docs_scanned: executor.docs_scanned(),
                entries_scanned: executor.entries_scanned(),
                groups_trimmed: executor.groups_evicted(),
            };
            Ok(SegmentResult::GroupBy {
                groups: executor.finish()?,
                stats,
            })
        }
    }
}

/// Fans a request out over segments and combines their partials.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn execute(
        &self,
        segments: &[Arc<ImmutableSegment>],
        request: &QueryRequest,
    ) -> Result<ReducedResult, QuarryError> {
        request.validate()?;
        let started = Instant::now();

        // --- Per-segment execution in parallel --- //
        let results: Vec<SegmentResult> = segments
            .par_iter()
            .map(|segment| execute_segment(segment, request, &self.config))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = ExecutionStats::default();
        for r in &results {
            stats.add(r.stats());
        }

        // --- Combine and reduce --- //
        let functions = request.functions();
        let mut reduced = match &request.group_by {
            None => self.reduce_aggregation(request, &functions, results)?,
            Some(group_by) => self.reduce_group_by(group_by, &functions, results, &mut stats)?,
        };
        reduced.stats = stats;

        let duration = started.elapsed();
        quarry_metrics::record_query(duration, stats.docs_scanned);
        self.config.event_listener.on_event(SegmentEvent::QueryExecuted {
            segments: segments.len(),
            docs_scanned: stats.docs_scanned,
            duration,
        });
        Ok(reduced)
    }

    fn reduce_aggregation(
        &self,
        request: &QueryRequest,
        functions: &[AggregationFunction],
        results: Vec<SegmentResult>,
    ) -> Result<ReducedResult, QuarryError> {
        let mut columns: Vec<Vec<IntermediateResult>> = vec![Vec::with_capacity(results.len()); functions.len()];
        for result in results {
            match result {
                SegmentResult::Aggregation { partials, .. } => {
                    for (column, p) in columns.iter_mut().zip(partials) {
                        column.push(p);
                    }
                }
                SegmentResult::GroupBy { .. } => {
                    return Err(QuarryError::Internal("group-by result in a plain aggregation".to_string()))
                }
            }
        }
        let aggregation = request
            .aggregations
            .iter()
            .zip(functions)
            .zip(columns)
            .map(|((spec, f), partials)| {
                Ok(AggregationResult {
                    label: spec.label(),
                    value: f.reduce(partials)?,
                })
            })
            .collect::<Result<Vec<_>, QuarryError>>()?;
        Ok(ReducedResult {
            aggregation,
            group_by: Vec::new(),
            stats: ExecutionStats::default(),
        })
    }

    fn reduce_group_by(
        &self,
        group_by: &GroupBySpec,
        functions: &[AggregationFunction],
        results: Vec<SegmentResult>,
        stats: &mut ExecutionStats,
    ) -> Result<ReducedResult, QuarryError> {
        let mut combined: GroupByResultHolder<Vec<Value>> =
            GroupByResultHolder::new(functions.to_vec(), self.config.num_groups_limit, group_by.order_by);
        for result in results {
            match result {
                SegmentResult::GroupBy { groups, .. } => {
                    for (key, partials) in groups {
                        combined.merge(key, partials)?;
                    }
                }
                SegmentResult::Aggregation { .. } => {
                    return Err(QuarryError::Internal("plain aggregation result in a group-by".to_string()))
                }
            }
        }
        combined.trim();
        stats.groups_trimmed += combined.evicted();
        if stats.groups_trimmed > 0 {
            self.config.event_listener.on_event(SegmentEvent::GroupsTrimmed {
                evicted: stats.groups_trimmed as usize,
                retained: combined.len(),
            });
        }

        let mut rows: Vec<GroupRow> = combined
            .into_groups()
            .into_iter()
            .map(|(key, partials)| GroupRow {
                key,
                values: partials.iter().map(IntermediateResult::finalize).collect(),
            })
            .collect();
        // ties (and unordered requests) fall back to key order for stable output
        match group_by.order_by {
            Some(order) => rows.sort_by(|a, b| order.compare(&a.values, &b.values).then_with(|| a.key.cmp(&b.key))),
            None => rows.sort_by(|a, b| a.key.cmp(&b.key)),
        }
        rows.truncate(group_by.limit.unwrap_or(DEFAULT_GROUP_LIMIT));

        Ok(ReducedResult {
            aggregation: Vec::new(),
            group_by: rows,
            stats: ExecutionStats::default(),
        })
    }
}
