//! Group-by: group key generation over dictionary ids and the bounded group result holder.
//!
//! Keys pack each column's dictionary id into a `u64` when the summed bit widths fit, most
//! significant column first; otherwise they fall back to the id tuple. Multi-value columns
//! contribute one key per element of the cross product of their id lists.

use crate::aggregation::{AggregationFunction, AggregationSpec, BoundAggregation, FinalValue, IntermediateResult};
use crate::block::ValueSet;
use crate::error::QuarryError;
use crate::loader::ImmutableSegment;
use crate::telemetry::quarry_metrics;
use crate::types::Value;

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// Holders at or below this capacity buffer generously and keep the best groups.
pub const SMALL_CAPACITY_LIMIT: usize = 100_000;
/// Minimum buffer size for small-capacity holders.
pub const MIN_TRIM_BUFFER: usize = 1_000_000;
/// Buffer growth over capacity for large-capacity holders.
pub const LARGE_CAPACITY_BUFFER_FACTOR: f64 = 1.2;

/// Bits reserved for one group-by column: `ceil(log2(cardinality)) + 1`.
pub fn group_key_bits(cardinality: u32) -> u32 {
    if cardinality <= 1 {
        1
    } else {
        32 - (cardinality - 1).leading_zeros() + 1
    }
}

/// Sort order for groups: by the final value of one aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub aggregation_index: usize,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    /// Score where larger is better. Null is always worst.
    fn score(&self, partials: &[IntermediateResult]) -> f64 {
        match partials.get(self.aggregation_index).map(|p| p.finalize()) {
            Some(v) => match v.as_f64() {
                Some(x) if self.descending => x,
                Some(x) => -x,
                None => f64::NEG_INFINITY,
            },
            None => f64::NEG_INFINITY,
        }
    }

    /// Ordering of two final rows, best first.
    pub fn compare(&self, a: &[FinalValue], b: &[FinalValue]) -> Ordering {
        let key = |row: &[FinalValue]| match row.get(self.aggregation_index).and_then(FinalValue::as_f64) {
            Some(x) if self.descending => x,
            Some(x) => -x,
            None => f64::NEG_INFINITY,
        };
        key(b).total_cmp(&key(a))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Packed(u64),
    Composite(Box<[u32]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKeyKind {
    Packed,
    Composite,
}

#[derive(Debug, Clone)]
struct KeyColumn {
    values: ValueSet,
    bits: u32,
    shift: u32,
}

/// Produces group keys for the docs of one block. Chosen once per segment.
#[derive(Debug, Clone)]
pub struct GroupKeyGenerator {
    columns: Vec<KeyColumn>,
    kind: GroupKeyKind,
    total_bits: u32,
}

impl GroupKeyGenerator {
    pub fn new(segment: &ImmutableSegment, columns: &[String]) -> Result<Self, QuarryError> {
        if columns.is_empty() {
            return Err(QuarryError::InvalidQuery("group-by needs at least one column".to_string()));
        }
        let mut sources = Vec::with_capacity(columns.len());
        for name in columns {
            let source = segment
                .data_source(name)
                .ok_or_else(|| QuarryError::InvalidQuery(format!("unknown group-by column {}", name)))?;
            if source.dictionary().is_none() {
                return Err(QuarryError::InvalidQuery(format!(
                    "group-by column {} has no dictionary",
                    name
                )));
            }
            sources.push(source);
        }
        let cardinalities: Vec<u32> = sources.iter().map(|s| s.metadata().cardinality).collect();
        let total_bits: u32 = cardinalities.iter().map(|c| group_key_bits(*c)).sum();
        let kind = if total_bits <= 64 {
            GroupKeyKind::Packed
        } else {
            GroupKeyKind::Composite
        };

        let mut shift = total_bits;
        let columns = sources
            .into_iter()
            .zip(cardinalities)
            .map(|(source, card)| {
                let bits = group_key_bits(card);
                shift = shift.saturating_sub(bits);
                KeyColumn {
                    values: ValueSet::new(Arc::clone(&source)),
                    bits,
                    shift,
                }
            })
            .collect();
        Ok(Self {
            columns,
            kind,
            total_bits,
        })
    }

    pub fn kind(&self) -> GroupKeyKind {
        self.kind
    }

    pub fn total_bits(&self) -> u32 {
        self.total_bits
    }

    fn key_of(&self, ids: &[u32]) -> GroupKey {
        match self.kind {
            GroupKeyKind::Packed => GroupKey::Packed(
                self.columns
                    .iter()
                    .zip(ids)
                    .fold(0u64, |key, (c, id)| key | ((*id as u64) << c.shift)),
            ),
            GroupKeyKind::Composite => GroupKey::Composite(ids.into()),
        }
    }

    /// Calls `f(i, key)` for every key of `docs[i]`: one per doc when every column is
    /// single-value, one per element of the id cross product otherwise.
    pub fn for_each_key(
        &self,
        docs: &[u32],
        mut f: impl FnMut(usize, GroupKey) -> Result<(), QuarryError>,
    ) -> Result<(), QuarryError> {
        let n = self.columns.len();
        if self.columns.iter().all(|c| c.values.is_single_value()) {
            let mut per_column = Vec::with_capacity(n);
            for c in &self.columns {
                let mut ids = Vec::with_capacity(docs.len());
                c.values.dictionary_ids(docs, &mut ids)?;
                per_column.push(ids);
            }
            let mut ids = vec![0u32; n];
            for i in 0..docs.len() {
                for (slot, col) in ids.iter_mut().zip(&per_column) {
                    *slot = col[i];
                }
                f(i, self.key_of(&ids))?;
            }
            return Ok(());
        }

        let mut lists: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut cursor = vec![0usize; n];
        let mut ids = vec![0u32; n];
        for (i, &doc) in docs.iter().enumerate() {
            for (c, list) in self.columns.iter().zip(lists.iter_mut()) {
                c.values.multi_value_ids(doc, list)?;
            }
            if lists.iter().any(Vec::is_empty) {
                continue;
            }
            cursor.iter_mut().for_each(|p| *p = 0);
            'cross: loop {
                for ((slot, list), p) in ids.iter_mut().zip(&lists).zip(&cursor) {
                    *slot = list[*p];
                }
                f(i, self.key_of(&ids))?;
                // odometer over the id lists, last column fastest
                let mut col = n;
                loop {
                    if col == 0 {
                        break 'cross;
                    }
                    col -= 1;
                    cursor[col] += 1;
                    if cursor[col] < lists[col].len() {
                        break;
                    }
                    cursor[col] = 0;
                }
            }
        }
        Ok(())
    }

    /// Dictionary ids of a key, in column order.
    pub fn decode_ids(&self, key: &GroupKey) -> Vec<u32> {
        match key {
            GroupKey::Packed(k) => self
                .columns
                .iter()
                .map(|c| ((k >> c.shift) & ((1u64 << c.bits) - 1)) as u32)
                .collect(),
            GroupKey::Composite(ids) => ids.to_vec(),
        }
    }

    /// Column values of a key.
    pub fn decode(&self, key: &GroupKey) -> Result<Vec<Value>, QuarryError> {
        self.decode_ids(key)
            .into_iter()
            .zip(&self.columns)
            .map(|(id, c)| {
                let dict = c.values.column().dictionary().ok_or_else(|| {
                    QuarryError::Internal(format!("group-by column {} lost its dictionary", c.values.column().name()))
                })?;
                dict.get(id)
            })
            .collect()
    }
}

/// How a full holder shrinks back to capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Keep a heap of the `capacity` best groups, drop the rest.
    RetainBest { buffer: usize },
    /// Keep a heap of the `len - capacity` worst groups and drop those.
    EvictWorst { buffer: usize },
}

impl TrimPolicy {
    pub fn for_capacity(capacity: usize) -> Self {
        if capacity <= SMALL_CAPACITY_LIMIT {
            TrimPolicy::RetainBest {
                buffer: capacity.max(MIN_TRIM_BUFFER),
            }
        } else {
            TrimPolicy::EvictWorst {
                buffer: (capacity as f64 * LARGE_CAPACITY_BUFFER_FACTOR) as usize,
            }
        }
    }

    pub fn buffer(&self) -> usize {
        match self {
            TrimPolicy::RetainBest { buffer } | TrimPolicy::EvictWorst { buffer } => *buffer,
        }
    }
}

#[derive(Debug, PartialEq)]
struct Scored(f64, usize);

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

/// Group → per-function partials, bounded by a capacity.
///
/// The map may grow to the policy's buffer size; the next new group past that trims it back
/// to `capacity`. With an ordering the lowest-ranked groups go; without one the evicted
/// groups are arbitrary.
#[derive(Debug)]
pub struct GroupByResultHolder<K> {
    functions: Vec<AggregationFunction>,
    groups: HashMap<K, Vec<IntermediateResult>>,
    capacity: usize,
    policy: TrimPolicy,
    order_by: Option<OrderBy>,
    evicted: u64,
}

impl<K: Hash + Eq + Clone> GroupByResultHolder<K> {
    pub fn new(functions: Vec<AggregationFunction>, capacity: usize, order_by: Option<OrderBy>) -> Self {
        Self::with_policy(functions, capacity, order_by, TrimPolicy::for_capacity(capacity))
    }

    pub fn with_policy(
        functions: Vec<AggregationFunction>,
        capacity: usize,
        order_by: Option<OrderBy>,
        policy: TrimPolicy,
    ) -> Self {
        Self {
            functions,
            groups: HashMap::new(),
            capacity: capacity.max(1),
            policy,
            order_by,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> TrimPolicy {
        self.policy
    }

    /// Groups dropped by trimming so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn get(&self, key: &K) -> Option<&[IntermediateResult]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    /// Partials of `key`, inserting identities for a new group (trimming first when full).
    pub fn entry(&mut self, key: K) -> &mut [IntermediateResult] {
        if !self.groups.contains_key(&key) && self.groups.len() >= self.policy.buffer().max(self.capacity) {
            self.trim();
        }
        let functions = &self.functions;
        self.groups
            .entry(key)
            .or_insert_with(|| functions.iter().map(|f| f.init()).collect())
    }

    /// Merges a whole partial row into `key`.
    pub fn merge(&mut self, key: K, partials: Vec<IntermediateResult>) -> Result<(), QuarryError> {
        if partials.len() != self.functions.len() {
            return Err(QuarryError::Internal(format!(
                "group row has {} partials, expected {}",
                partials.len(),
                self.functions.len()
            )));
        }
        let slots = self.entry(key);
        for (slot, p) in slots.iter_mut().zip(partials) {
            slot.merge(p)?;
        }
        Ok(())
    }

    /// Shrinks to `capacity` groups; returns how many were dropped.
    pub fn trim(&mut self) -> usize {
        let excess = self.groups.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let keys: Vec<K> = self.groups.keys().cloned().collect();
        let drop: HashSet<usize> = match self.order_by {
            None => (0..excess).collect(),
            Some(order) => {
                let scores: Vec<f64> = keys.iter().map(|k| order.score(&self.groups[k])).collect();
                match self.policy {
                    TrimPolicy::RetainBest { .. } => {
                        // min-heap of keepers: the worst keeper sits on top
                        let mut heap = BinaryHeap::with_capacity(self.capacity + 1);
                        for (i, s) in scores.iter().enumerate() {
                            heap.push(Reverse(Scored(*s, i)));
                            if heap.len() > self.capacity {
                                heap.pop();
                            }
                        }
                        let keep: HashSet<usize> = heap.into_iter().map(|Reverse(Scored(_, i))| i).collect();
                        (0..keys.len()).filter(|i| !keep.contains(i)).collect()
                    }
                    TrimPolicy::EvictWorst { .. } => {
                        // max-heap of victims: the best victim sits on top
                        let mut heap = BinaryHeap::with_capacity(excess + 1);
                        for (i, s) in scores.iter().enumerate() {
                            heap.push(Scored(*s, i));
                            if heap.len() > excess {
                                heap.pop();
                            }
                        }
                        heap.into_iter().map(|Scored(_, i)| i).collect()
                    }
                }
            }
        };
        for i in &drop {
            self.groups.remove(&keys[*i]);
        }
        self.evicted += drop.len() as u64;
        quarry_metrics::record_groups_trimmed(drop.len() as u64, self.groups.len());
        drop.len()
    }

    pub fn into_groups(self) -> Vec<(K, Vec<IntermediateResult>)> {
        self.groups.into_iter().collect()
    }
}

/// Group-by over one segment.
#[derive(Debug)]
pub struct GroupByExecutor {
    keys: GroupKeyGenerator,
    aggregations: Vec<BoundAggregation>,
    holder: GroupByResultHolder<GroupKey>,
    docs_scanned: u64,
    entries_scanned: u64,
}

impl GroupByExecutor {
    pub fn new(
        segment: &ImmutableSegment,
        columns: &[String],
        specs: &[AggregationSpec],
        capacity: usize,
        order_by: Option<OrderBy>,
    ) -> Result<Self, QuarryError> {
        let keys = GroupKeyGenerator::new(segment, columns)?;
        let aggregations = specs
            .iter()
            .map(|s| BoundAggregation::bind(s, segment))
            .collect::<Result<Vec<_>, _>>()?;
        let functions = aggregations.iter().map(|a| a.function).collect();
        Ok(Self {
            keys,
            aggregations,
            holder: GroupByResultHolder::new(functions, capacity, order_by),
            docs_scanned: 0,
            entries_scanned: 0,
        })
    }

    pub fn key_generator(&self) -> &GroupKeyGenerator {
        &self.keys
    }

    pub fn process_block(&mut self, docs: &[u32]) -> Result<(), QuarryError> {
        self.docs_scanned += docs.len() as u64;
        let inputs = self
            .aggregations
            .iter()
            .map(|a| a.fetch(docs))
            .collect::<Result<Vec<_>, _>>()?;
        self.entries_scanned += inputs.iter().map(|v| v.entries()).sum::<u64>();

        let aggregations = &self.aggregations;
        let holder = &mut self.holder;
        self.keys.for_each_key(docs, |i, key| {
            let partials = holder.entry(key);
            for ((agg, input), acc) in aggregations.iter().zip(&inputs).zip(partials.iter_mut()) {
                agg.function.accumulate(acc, input.for_doc(i))?;
            }
            Ok(())
        })
    }

    pub fn docs_scanned(&self) -> u64 {
        self.docs_scanned
    }

    pub fn entries_scanned(&self) -> u64 {
        self.entries_scanned
    }

    pub fn groups_evicted(&self) -> u64 {
        self.holder.evicted()
    }

    /// Groups with their keys decoded to column values.
    pub fn finish(self) -> Result<Vec<(Vec<Value>, Vec<IntermediateResult>)>, QuarryError> {
        let keys = self.keys;
        self.holder
            .into_groups()
            .into_iter()
            .map(|(k, partials)| Ok((keys.decode(&k)?, partials)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bits_follow_ceil_log2_plus_one() {
        assert_eq!(group_key_bits(0), 1);
        assert_eq!(group_key_bits(1), 1);
        assert_eq!(group_key_bits(2), 2);
        assert_eq!(group_key_bits(10), 5);
        assert_eq!(group_key_bits(1000), 11);
        assert_eq!(group_key_bits(1024), 11);
        assert_eq!(group_key_bits(1025), 12);
    }

    fn count_holder(capacity: usize, policy: TrimPolicy) -> GroupByResultHolder<u32> {
        GroupByResultHolder::with_policy(
            vec![AggregationFunction::Count],
            capacity,
            Some(OrderBy {
                aggregation_index: 0,
                descending: true,
            }),
            policy,
        )
    }

    fn fill(holder: &mut GroupByResultHolder<u32>, groups: u32) {
        // group g receives g + 1 docs
        for g in 0..groups {
            let slot = holder.entry(g);
            AggregationFunction::Count
                .accumulate(&mut slot[0], crate::aggregation::AggregationInput::Count(g as u64 + 1))
                .unwrap();
        }
    }

    #[test]
    fn retain_best_keeps_highest_counts() {
        let mut holder = count_holder(3, TrimPolicy::RetainBest { buffer: 5 });
        fill(&mut holder, 10);
        holder.trim();
        let mut kept: Vec<u32> = holder.into_groups().into_iter().map(|(k, _)| k).collect();
        kept.sort();
        assert_eq!(kept, vec![7, 8, 9]);
    }

    #[test]
    fn evict_worst_keeps_highest_counts() {
        let mut holder = count_holder(4, TrimPolicy::EvictWorst { buffer: 6 });
        fill(&mut holder, 12);
        holder.trim();
        assert_eq!(holder.len(), 4);
        let mut kept: Vec<u32> = holder.into_groups().into_iter().map(|(k, _)| k).collect();
        kept.sort();
        assert_eq!(kept, vec![8, 9, 10, 11]);
    }

    #[test]
    fn policy_thresholds() {
        assert_eq!(
            TrimPolicy::for_capacity(5_000),
            TrimPolicy::RetainBest { buffer: 1_000_000 }
        );
        assert_eq!(
            TrimPolicy::for_capacity(200_000),
            TrimPolicy::EvictWorst { buffer: 240_000 }
        );
    }

    #[test]
    fn holder_grows_to_buffer_before_trimming() {
        let mut holder = count_holder(2, TrimPolicy::RetainBest { buffer: 4 });
        fill(&mut holder, 4);
        assert_eq!(holder.len(), 4);
        assert_eq!(holder.evicted(), 0);
        fill(&mut holder, 5);
        // the fifth group forced a trim back to capacity, then was inserted
        assert_eq!(holder.len(), 3);
        assert_eq!(holder.evicted(), 2);
    }

    #[test]
    fn order_by_compare_puts_best_first() {
        let desc = OrderBy {
            aggregation_index: 0,
            descending: true,
        };
        let mut rows = vec![vec![FinalValue::Long(1)], vec![FinalValue::Null], vec![FinalValue::Long(5)]];
        rows.sort_by(|a, b| desc.compare(a, b));
        assert_eq!(rows[0], vec![FinalValue::Long(5)]);
        assert_eq!(rows[2], vec![FinalValue::Null]);
    }
}
