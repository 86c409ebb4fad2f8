//! Filter operators: predicate leaves, AND/OR combinators, and doc-id chunking.
//!
//! Every filter operator produces exactly one block whose doc-id set is either a set of
//! matching docs or `None` ("no result"). `None` propagates through AND; OR skips it.

use crate::block::{Block, DocIdIter, DocIdSet, DocIdSource, FilterBlock, Operator};
use crate::datasource::ColumnDataSource;
use crate::dictionary::Dictionary;
use crate::error::QuarryError;
use crate::forward_index::{ForwardIndex, SingleValueForwardIndex};
use crate::loader::ImmutableSegment;
use crate::types::Value;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::ops::{Bound, Range};
use std::sync::Arc;

/// Default upper bound on doc ids per block emitted by [`DocIdSetOperator`].
pub const DEFAULT_MAX_DOCS_PER_BLOCK: usize = 10_000;

const SCAN_CHUNK_ROWS: usize = 4096;

fn inclusive() -> bool {
    true
}

/// A condition on one column. Literals are coerced to the column's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(Value),
    NotEq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Range {
        #[serde(default)]
        lower: Option<Value>,
        #[serde(default)]
        upper: Option<Value>,
        #[serde(default = "inclusive")]
        lower_inclusive: bool,
        #[serde(default = "inclusive")]
        upper_inclusive: bool,
    },
}

impl Predicate {
    fn bounds(&self) -> (Bound<&Value>, Bound<&Value>) {
        fn bound(v: &Option<Value>, incl: bool) -> Bound<&Value> {
            match v {
                None => Bound::Unbounded,
                Some(v) if incl => Bound::Included(v),
                Some(v) => Bound::Excluded(v),
            }
        }
        match self {
            Predicate::Range {
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            } => (bound(lower, *lower_inclusive), bound(upper, *upper_inclusive)),
            _ => (Bound::Unbounded, Bound::Unbounded),
        }
    }
}

/// Boolean filter tree over predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Predicate { column: String, predicate: Predicate },
}

impl FilterNode {
    pub fn predicate(column: &str, predicate: Predicate) -> Self {
        FilterNode::Predicate {
            column: column.to_string(),
            predicate,
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::predicate(column, Predicate::Eq(value.into()))
    }

    pub fn in_list<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::predicate(column, Predicate::In(values.into_iter().map(Into::into).collect()))
    }

    /// Inclusive range; either side may be open.
    pub fn between(column: &str, lower: Option<Value>, upper: Option<Value>) -> Self {
        Self::predicate(
            column,
            Predicate::Range {
                lower,
                upper,
                lower_inclusive: true,
                upper_inclusive: true,
            },
        )
    }
}

// --- leaves ---

/// Matches every doc of the segment.
#[derive(Debug)]
pub struct MatchAllOperator {
    total_docs: u32,
    done: bool,
}

impl MatchAllOperator {
    pub fn new(total_docs: u32) -> Self {
        Self {
            total_docs,
            done: false,
        }
    }
}

impl Operator for MatchAllOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(None);
        }
        Ok(Some(Block::Predicate(FilterBlock::new(Some(DocIdSet::Range(
            0..self.total_docs,
        ))))))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }
}

/// Emits a precomputed doc-id set (or `None`).
#[derive(Debug)]
pub struct BitmapOperator {
    doc_ids: Option<Option<DocIdSet>>,
}

impl BitmapOperator {
    pub fn new(doc_ids: Option<DocIdSet>) -> Self {
        Self {
            doc_ids: Some(doc_ids),
        }
    }
}

impl Operator for BitmapOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        Ok(self.doc_ids.take().map(|ids| Block::Predicate(FilterBlock::new(ids))))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }
}

/// Evaluates one predicate against one column.
///
/// Dictionary columns map the predicate to the set of matching dictionary ids first. The doc
/// set then comes from the sorted doc ranges (sorted columns), the inverted index (when
/// present), or a forward index scan, in that order of preference. Raw columns are scanned.
#[derive(Debug)]
pub struct PredicateOperator {
    source: Arc<ColumnDataSource>,
    predicate: Predicate,
    done: bool,
}

impl PredicateOperator {
    pub fn new(source: Arc<ColumnDataSource>, predicate: Predicate) -> Result<Self, QuarryError> {
        let is_range = matches!(predicate, Predicate::Range { .. });
        if is_range {
            if let (Bound::Unbounded, Bound::Unbounded) = predicate.bounds() {
                return Err(QuarryError::InvalidQuery(format!(
                    "range on column {} has no bounds",
                    source.name()
                )));
            }
        }
        Ok(Self {
            source,
            predicate,
            done: false,
        })
    }

    fn evaluate(&self) -> Result<Option<DocIdSet>, QuarryError> {
        let docs = match (self.source.dictionary(), self.source.forward_index()) {
            (Some(dict), forward) => {
                let ids = matching_dict_ids(&self.predicate, dict)?;
                if ids.is_empty() {
                    return Ok(None);
                }
                match forward {
                    ForwardIndex::SingleValue(f) if self.source.metadata().sorted => sorted_doc_ranges(f, &ids)?,
                    _ => match self.source.inverted_index() {
                        Some(inv) => {
                            if ids.len() == 1 {
                                DocIdSet::Bitmap(inv.get_doc_ids(ids.min().unwrap_or(0))?)
                            } else {
                                let mut acc = RoaringBitmap::new();
                                for id in &ids {
                                    acc |= inv.get_doc_ids(id)?.as_ref();
                                }
                                DocIdSet::Bitmap(Arc::new(acc))
                            }
                        }
                        None => scan_dictionary_ids(forward, &ids, self.source.total_docs())?,
                    },
                }
            }
            (None, ForwardIndex::Raw(raw)) => {
                let matcher = RawMatcher::new(&self.predicate, raw.data_type())?;
                let mut matched = Vec::new();
                let mut values = Vec::with_capacity(SCAN_CHUNK_ROWS);
                let docs: Vec<u32> = (0..raw.num_docs()).collect();
                for chunk in docs.chunks(SCAN_CHUNK_ROWS) {
                    values.clear();
                    raw.read_values(chunk, &mut values)?;
                    matched.extend(
                        chunk
                            .iter()
                            .zip(&values)
                            .filter(|(_, v)| matcher.matches(v))
                            .map(|(doc, _)| *doc),
                    );
                }
                DocIdSet::Sorted(Arc::from(matched))
            }
            (None, _) => {
                return Err(QuarryError::Internal(format!(
                    "column {} has neither a dictionary nor a raw index",
                    self.source.name()
                )))
            }
        };
        Ok(if docs.is_empty() { None } else { Some(docs) })
    }
}

impl Operator for PredicateOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(None);
        }
        Ok(Some(Block::Predicate(FilterBlock::new(self.evaluate()?))))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        Ok(())
    }
}

fn matching_dict_ids(predicate: &Predicate, dict: &Dictionary) -> Result<RoaringBitmap, QuarryError> {
    let mut ids = RoaringBitmap::new();
    match predicate {
        Predicate::Eq(v) => ids.extend(dict.index_of(v)),
        Predicate::In(vs) => ids.extend(vs.iter().filter_map(|v| dict.index_of(v))),
        Predicate::NotEq(v) => {
            ids.insert_range(0..dict.len());
            if let Some(id) = dict.index_of(v) {
                ids.remove(id);
            }
        }
        Predicate::NotIn(vs) => {
            ids.insert_range(0..dict.len());
            for id in vs.iter().filter_map(|v| dict.index_of(v)) {
                ids.remove(id);
            }
        }
        Predicate::Range { .. } => {
            let (lower, upper) = predicate.bounds();
            ids.insert_range(dict.range_ids(lower, upper)?);
        }
    }
    Ok(ids)
}

/// First row whose id is `>= id`; ids are non-decreasing in row order.
fn first_row_at_least(f: &SingleValueForwardIndex, id: u32) -> Result<u32, QuarryError> {
    let (mut lo, mut hi) = (0u32, f.num_rows());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if f.get(mid)? < id {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

fn sorted_doc_ranges(f: &SingleValueForwardIndex, ids: &RoaringBitmap) -> Result<DocIdSet, QuarryError> {
    let mut runs: Vec<Range<u32>> = Vec::new();
    for id in ids {
        match runs.last_mut() {
            Some(run) if run.end == id => run.end = id + 1,
            _ => runs.push(id..id + 1),
        }
    }
    let mut docs: Vec<Range<u32>> = Vec::with_capacity(runs.len());
    for run in runs {
        let start = first_row_at_least(f, run.start)?;
        let end = first_row_at_least(f, run.end)?;
        if start < end {
            docs.push(start..end);
        }
    }
    Ok(match docs.len() {
        0 => DocIdSet::empty(),
        1 => DocIdSet::Range(docs.remove(0)),
        _ => {
            let mut b = RoaringBitmap::new();
            for r in docs {
                b.insert_range(r);
            }
            DocIdSet::Bitmap(Arc::new(b))
        }
    })
}

fn scan_dictionary_ids(forward: &ForwardIndex, ids: &RoaringBitmap, total_docs: u32) -> Result<DocIdSet, QuarryError> {
    let mut matched = Vec::new();
    match forward {
        ForwardIndex::SingleValue(f) => {
            let mut buf = vec![0u32; SCAN_CHUNK_ROWS];
            let mut start = 0u32;
            while start < total_docs {
                let n = (total_docs - start).min(SCAN_CHUNK_ROWS as u32) as usize;
                f.read_range(start, &mut buf[..n])?;
                for (i, id) in buf[..n].iter().enumerate() {
                    if ids.contains(*id) {
                        matched.push(start + i as u32);
                    }
                }
                start += n as u32;
            }
        }
        ForwardIndex::MultiValue(f) => {
            let mut buf = Vec::new();
            for doc in 0..total_docs {
                f.read_into(doc, &mut buf)?;
                if buf.iter().any(|id| ids.contains(*id)) {
                    matched.push(doc);
                }
            }
        }
        ForwardIndex::Raw(_) => {
            return Err(QuarryError::Internal("dictionary scan over a raw index".to_string()))
        }
    }
    Ok(DocIdSet::Sorted(Arc::from(matched)))
}

/// Predicate evaluation on raw values: equality on values coerced to the column type,
/// ranges compared numerically.
enum RawMatcher {
    In(BTreeSet<Value>),
    NotIn(BTreeSet<Value>),
    Range {
        lower: Bound<f64>,
        upper: Bound<f64>,
    },
}

impl RawMatcher {
    fn new(predicate: &Predicate, data_type: crate::types::DataType) -> Result<Self, QuarryError> {
        let coerced =
            |vs: &[Value]| -> BTreeSet<Value> { vs.iter().filter_map(|v| v.coerce_to(data_type).ok()).collect() };
        Ok(match predicate {
            Predicate::Eq(v) => RawMatcher::In(coerced(std::slice::from_ref(v))),
            Predicate::In(vs) => RawMatcher::In(coerced(vs)),
            Predicate::NotEq(v) => RawMatcher::NotIn(coerced(std::slice::from_ref(v))),
            Predicate::NotIn(vs) => RawMatcher::NotIn(coerced(vs)),
            Predicate::Range { .. } => {
                let numeric = |b: Bound<&Value>| -> Result<Bound<f64>, QuarryError> {
                    let f = |v: &Value| {
                        v.as_f64().ok_or_else(|| {
                            QuarryError::InvalidQuery(format!("range bound {} is not numeric", v))
                        })
                    };
                    Ok(match b {
                        Bound::Unbounded => Bound::Unbounded,
                        Bound::Included(v) => Bound::Included(f(v)?),
                        Bound::Excluded(v) => Bound::Excluded(f(v)?),
                    })
                };
                let (lower, upper) = predicate.bounds();
                RawMatcher::Range {
                    lower: numeric(lower)?,
                    upper: numeric(upper)?,
                }
            }
        })
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            RawMatcher::In(set) => set.contains(value),
            RawMatcher::NotIn(set) => !set.contains(value),
            RawMatcher::Range { lower, upper } => {
                let Some(x) = value.as_f64() else {
                    return false;
                };
                let above = match lower {
                    Bound::Unbounded => true,
                    Bound::Included(l) => x >= *l,
                    Bound::Excluded(l) => x > *l,
                };
                let below = match upper {
                    Bound::Unbounded => true,
                    Bound::Included(u) => x <= *u,
                    Bound::Excluded(u) => x < *u,
                };
                above && below
            }
        }
    }
}

// --- combinators ---

fn next_filter_set(child: &mut FilterOperator) -> Result<Option<Option<DocIdSet>>, QuarryError> {
    Ok(child.next_block()?.map(|b| b.doc_id_set()))
}

/// Intersection of its children. Any child answering `None` makes the result `None`.
#[derive(Debug)]
pub struct AndOperator {
    children: Vec<FilterOperator>,
}

impl AndOperator {
    pub fn new(children: Vec<FilterOperator>) -> Self {
        Self { children }
    }
}

impl Operator for AndOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        self.children.iter_mut().try_for_each(Operator::open)
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        let mut sets = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            match next_filter_set(child)? {
                None => return Ok(None),
                // remaining children are never evaluated
                Some(None) => return Ok(Some(Block::And(FilterBlock::new(None)))),
                Some(Some(set)) => sets.push(set),
            }
        }
        if sets.is_empty() {
            return Ok(Some(Block::And(FilterBlock::new(None))));
        }
        Ok(Some(Block::And(FilterBlock::new(Some(intersect(sets))))))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        self.children.iter_mut().try_for_each(Operator::close)
    }
}

fn intersect(mut sets: Vec<DocIdSet>) -> DocIdSet {
    if sets.len() == 1 {
        return sets.remove(0);
    }
    if sets.iter().all(|s| matches!(s, DocIdSet::Range(_))) {
        let (mut start, mut end) = (0u32, u32::MAX);
        for s in &sets {
            if let DocIdSet::Range(r) = s {
                start = start.max(r.start);
                end = end.min(r.end);
            }
        }
        return DocIdSet::Range(start..end.max(start));
    }
    sets.sort_by_key(DocIdSet::len);
    let mut acc = sets[0].to_bitmap();
    for s in &sets[1..] {
        match s {
            DocIdSet::Bitmap(b) => acc &= b.as_ref(),
            DocIdSet::Range(r) => {
                acc.remove_range(..r.start);
                acc.remove_range(r.end..);
            }
            DocIdSet::Sorted(ids) => acc &= ids.iter().copied().collect::<RoaringBitmap>(),
        }
    }
    DocIdSet::Bitmap(Arc::new(acc))
}

/// Union of its children by k-way merge. `None` children are skipped; the result is `None`
/// only when every child is `None`.
#[derive(Debug)]
pub struct OrOperator {
    children: Vec<FilterOperator>,
}

impl OrOperator {
    pub fn new(children: Vec<FilterOperator>) -> Self {
        Self { children }
    }
}

impl Operator for OrOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        self.children.iter_mut().try_for_each(Operator::open)
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        let mut sets = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            match next_filter_set(child)? {
                None => return Ok(None),
                Some(None) => {}
                Some(Some(set)) => sets.push(set),
            }
        }
        if sets.is_empty() {
            return Ok(Some(Block::Or(FilterBlock::new(None))));
        }
        Ok(Some(Block::Or(FilterBlock::new(Some(DocIdSet::Bitmap(Arc::new(merge_union(&sets))))))))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        self.children.iter_mut().try_for_each(Operator::close)
    }
}

fn merge_union(sets: &[DocIdSet]) -> RoaringBitmap {
    let mut iters: Vec<DocIdIter<'_>> = sets.iter().map(DocIdSet::iter).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());
    for (child, it) in iters.iter_mut().enumerate() {
        if let Some(doc) = it.next() {
            heap.push(Reverse((doc, child)));
        }
    }
    let mut out = RoaringBitmap::new();
    let mut last: Option<u32> = None;
    while let Some(Reverse((doc, child))) = heap.pop() {
        if last != Some(doc) {
            out.push(doc);
            last = Some(doc);
        }
        if let Some(next) = iters[child].next() {
            heap.push(Reverse((next, child)));
        }
    }
    out
}

/// Closed set of filter operators.
#[derive(Debug)]
pub enum FilterOperator {
    MatchAll(MatchAllOperator),
    Bitmap(BitmapOperator),
    Predicate(PredicateOperator),
    And(AndOperator),
    Or(OrOperator),
}

impl Operator for FilterOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        match self {
            FilterOperator::MatchAll(op) => op.open(),
            FilterOperator::Bitmap(op) => op.open(),
            FilterOperator::Predicate(op) => op.open(),
            FilterOperator::And(op) => op.open(),
            FilterOperator::Or(op) => op.open(),
        }
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        match self {
            FilterOperator::MatchAll(op) => op.next_block(),
            FilterOperator::Bitmap(op) => op.next_block(),
            FilterOperator::Predicate(op) => op.next_block(),
            FilterOperator::And(op) => op.next_block(),
            FilterOperator::Or(op) => op.next_block(),
        }
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        match self {
            FilterOperator::MatchAll(op) => op.close(),
            FilterOperator::Bitmap(op) => op.close(),
            FilterOperator::Predicate(op) => op.close(),
            FilterOperator::And(op) => op.close(),
            FilterOperator::Or(op) => op.close(),
        }
    }
}

/// Builds the operator tree for `filter`; no filter matches every doc.
pub fn build_filter_operator(
    segment: &ImmutableSegment,
    filter: Option<&FilterNode>,
) -> Result<FilterOperator, QuarryError> {
    match filter {
        None => Ok(FilterOperator::MatchAll(MatchAllOperator::new(segment.total_docs()))),
        Some(node) => build_node(segment, node),
    }
}

fn build_node(segment: &ImmutableSegment, node: &FilterNode) -> Result<FilterOperator, QuarryError> {
    let children = |nodes: &[FilterNode], what: &str| -> Result<Vec<FilterOperator>, QuarryError> {
        if nodes.is_empty() {
            return Err(QuarryError::InvalidQuery(format!("{} with no children", what)));
        }
        nodes.iter().map(|n| build_node(segment, n)).collect()
    };
    match node {
        FilterNode::And(nodes) => Ok(FilterOperator::And(AndOperator::new(children(nodes, "AND")?))),
        FilterNode::Or(nodes) => Ok(FilterOperator::Or(OrOperator::new(children(nodes, "OR")?))),
        FilterNode::Predicate { column, predicate } => {
            let source = segment
                .data_source(column)
                .ok_or_else(|| QuarryError::InvalidQuery(format!("unknown filter column {}", column)))?;
            Ok(FilterOperator::Predicate(PredicateOperator::new(source, predicate.clone())?))
        }
    }
}

enum DocCursor {
    Range(Range<u32>),
    Ids { ids: Arc<[u32]>, pos: usize },
}

/// Re-emits the single block of a filter operator as `DocIds` blocks of bounded size.
pub struct DocIdSetOperator {
    filter: FilterOperator,
    max_docs_per_block: usize,
    cursor: Option<DocCursor>,
    started: bool,
}

impl DocIdSetOperator {
    pub fn new(filter: FilterOperator, max_docs_per_block: usize) -> Self {
        Self {
            filter,
            max_docs_per_block: max_docs_per_block.max(1),
            cursor: None,
            started: false,
        }
    }
}

impl Operator for DocIdSetOperator {
    fn open(&mut self) -> Result<(), QuarryError> {
        self.filter.open()
    }

    fn next_block(&mut self) -> Result<Option<Block>, QuarryError> {
        if !self.started {
            self.started = true;
            self.cursor = match self.filter.next_block()?.and_then(|b| b.doc_id_set()) {
                None => None,
                Some(DocIdSet::Range(r)) => Some(DocCursor::Range(r)),
                Some(DocIdSet::Sorted(ids)) => Some(DocCursor::Ids { ids, pos: 0 }),
                Some(DocIdSet::Bitmap(b)) => Some(DocCursor::Ids {
                    ids: b.iter().collect::<Vec<_>>().into(),
                    pos: 0,
                }),
            };
        }
        let max = self.max_docs_per_block;
        let chunk = match &mut self.cursor {
            None => None,
            Some(DocCursor::Range(r)) => {
                if r.is_empty() {
                    None
                } else {
                    let end = r.end.min(r.start.saturating_add(max as u32));
                    let chunk = r.start..end;
                    r.start = end;
                    Some(DocIdSet::Range(chunk))
                }
            }
            Some(DocCursor::Ids { ids, pos }) => {
                if *pos >= ids.len() {
                    None
                } else {
                    let end = ids.len().min(*pos + max);
                    let chunk: Arc<[u32]> = Arc::from(&ids[*pos..end]);
                    *pos = end;
                    Some(DocIdSet::Sorted(chunk))
                }
            }
        };
        Ok(chunk.map(Block::DocIds))
    }

    fn close(&mut self) -> Result<(), QuarryError> {
        self.cursor = None;
        self.filter.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(ids: &[u32]) -> FilterOperator {
        FilterOperator::Bitmap(BitmapOperator::new(Some(DocIdSet::Bitmap(Arc::new(
            ids.iter().copied().collect(),
        )))))
    }

    fn none_leaf() -> FilterOperator {
        FilterOperator::Bitmap(BitmapOperator::new(None))
    }

    fn run(mut op: FilterOperator) -> Option<Vec<u32>> {
        op.open().unwrap();
        let block = op.next_block().unwrap().expect("one block");
        assert!(op.next_block().unwrap().is_none());
        op.close().unwrap();
        block.doc_id_set().map(|s| s.iter().collect())
    }

    #[test]
    fn and_intersects_children() {
        let and = FilterOperator::And(AndOperator::new(vec![leaf(&[1, 3, 5]), leaf(&[3, 5, 7])]));
        assert_eq!(run(and), Some(vec![3, 5]));
    }

    #[test]
    fn and_with_a_none_child_is_none() {
        let and = FilterOperator::And(AndOperator::new(vec![leaf(&[1, 3, 5]), none_leaf()]));
        assert_eq!(run(and), None);
    }

    #[test]
    fn and_stops_at_the_first_none_child() {
        let mut and = AndOperator::new(vec![none_leaf(), leaf(&[0, 1, 2])]);
        and.open().unwrap();
        let block = and.next_block().unwrap().expect("one block");
        assert!(block.doc_id_set().is_none());
        match &and.children[1] {
            FilterOperator::Bitmap(b) => assert!(b.doc_ids.is_some(), "second child was pulled"),
            other => panic!("unexpected child {:?}", other),
        }
        assert!(and.next_block().unwrap().is_none());
        and.close().unwrap();
    }

    #[test]
    fn or_of_empty_sets_is_empty_not_none() {
        let or = FilterOperator::Or(OrOperator::new(vec![leaf(&[]), none_leaf(), leaf(&[])]));
        assert_eq!(run(or), Some(vec![]));
    }

    #[test]
    fn and_of_disjoint_sets_is_empty_not_none() {
        let and = FilterOperator::And(AndOperator::new(vec![leaf(&[1]), leaf(&[2])]));
        assert_eq!(run(and), Some(vec![]));
    }

    #[test]
    fn and_of_ranges_stays_a_range() {
        let set = intersect(vec![DocIdSet::Range(0..10), DocIdSet::Range(5..20)]);
        assert_eq!(set, DocIdSet::Range(5..10));
    }

    #[test]
    fn or_merges_and_keeps_doc_zero() {
        let or = FilterOperator::Or(OrOperator::new(vec![leaf(&[1, 3, 5]), leaf(&[3, 5, 7])]));
        assert_eq!(run(or), Some(vec![1, 3, 5, 7]));

        let or = FilterOperator::Or(OrOperator::new(vec![leaf(&[0, 4]), leaf(&[0, 2]), none_leaf()]));
        assert_eq!(run(or), Some(vec![0, 2, 4]));
    }

    #[test]
    fn or_of_only_none_children_is_none() {
        let or = FilterOperator::Or(OrOperator::new(vec![none_leaf(), none_leaf()]));
        assert_eq!(run(or), None);
    }

    #[test]
    fn doc_id_set_operator_chunks_ranges_and_bitmaps() {
        let mut op = DocIdSetOperator::new(FilterOperator::MatchAll(MatchAllOperator::new(25)), 10);
        op.open().unwrap();
        let mut sizes = Vec::new();
        while let Some(block) = op.next_block().unwrap() {
            sizes.push(block.doc_id_set().map(|s| s.len()).unwrap_or(0));
        }
        assert_eq!(sizes, vec![10, 10, 5]);

        let ids: Vec<u32> = (0..7).map(|i| i * 3).collect();
        let mut op = DocIdSetOperator::new(leaf(&ids), 3);
        op.open().unwrap();
        let mut seen = Vec::new();
        while let Some(block) = op.next_block().unwrap() {
            let set = block.doc_id_set().unwrap();
            assert!(set.len() <= 3);
            seen.extend(set.iter());
        }
        assert_eq!(seen, ids);
    }

    #[test]
    fn doc_id_set_operator_emits_nothing_for_none() {
        let mut op = DocIdSetOperator::new(none_leaf(), 10);
        op.open().unwrap();
        assert!(op.next_block().unwrap().is_none());
    }

    #[test]
    fn filter_json_uses_tagged_literals() {
        let node: FilterNode = serde_json::from_str(
            r#"{"and":[{"predicate":{"column":"country","predicate":{"eq":{"string":"us"}}}},
                       {"predicate":{"column":"clicks","predicate":{"range":{"lower":{"int":10}}}}}]}"#,
        )
        .unwrap();
        assert_eq!(
            node,
            FilterNode::And(vec![
                FilterNode::eq("country", "us"),
                FilterNode::between("clicks", Some(Value::Int(10)), None),
            ])
        );
    }
}
