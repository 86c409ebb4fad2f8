//! Blocks: the unit of data flowing between operators.
//!
//! A block exposes capabilities rather than a fixed shape. Filter blocks carry a set of
//! matching doc ids; column blocks carry a [`ValueSet`] to read values for doc ids produced by
//! a filter. Asking a block for a capability it does not have is an `UnsupportedOperation`.

use crate::datasource::ColumnDataSource;
use crate::error::QuarryError;
use crate::forward_index::ForwardIndex;
use crate::types::Value;

use roaring::RoaringBitmap;
use std::ops::Range;
use std::sync::Arc;

pub trait DocIdSource {
    /// `None` means "no result" and is distinct from an empty set.
    fn doc_id_set(&self) -> Option<DocIdSet>;
}

pub trait ValueSource {
    fn value_set(&self) -> Result<ValueSet, QuarryError>;
}

/// Pull-based operator. Single pass: `open`, then `next_block` until `None`, then `close`.
pub trait Operator {
    fn open(&mut self) -> Result<(), QuarryError>;
    fn next_block(&mut self) -> Result<Option<Block>, QuarryError>;
    fn close(&mut self) -> Result<(), QuarryError>;
}

/// Ascending doc ids.
#[derive(Debug, Clone, PartialEq)]
pub enum DocIdSet {
    Bitmap(Arc<RoaringBitmap>),
    Range(Range<u32>),
    /// Strictly ascending ids.
    Sorted(Arc<[u32]>),
}

impl DocIdSet {
    pub fn empty() -> Self {
        DocIdSet::Sorted(Arc::from(Vec::new()))
    }

    /// A fresh ascending iterator; each call starts from the beginning.
    pub fn iter(&self) -> DocIdIter<'_> {
        match self {
            DocIdSet::Bitmap(b) => DocIdIter::Bitmap(b.iter()),
            DocIdSet::Range(r) => DocIdIter::Range(r.clone()),
            DocIdSet::Sorted(ids) => DocIdIter::Sorted(ids.iter()),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            DocIdSet::Bitmap(b) => b.len(),
            DocIdSet::Range(r) => r.end.saturating_sub(r.start) as u64,
            DocIdSet::Sorted(ids) => ids.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, doc: u32) -> bool {
        match self {
            DocIdSet::Bitmap(b) => b.contains(doc),
            DocIdSet::Range(r) => r.contains(&doc),
            DocIdSet::Sorted(ids) => ids.binary_search(&doc).is_ok(),
        }
    }

    pub fn to_bitmap(&self) -> RoaringBitmap {
        match self {
            DocIdSet::Bitmap(b) => (**b).clone(),
            DocIdSet::Range(r) => {
                let mut b = RoaringBitmap::new();
                b.insert_range(r.clone());
                b
            }
            DocIdSet::Sorted(ids) => ids.iter().copied().collect(),
        }
    }
}

pub enum DocIdIter<'a> {
    Bitmap(roaring::bitmap::Iter<'a>),
    Range(Range<u32>),
    Sorted(std::slice::Iter<'a, u32>),
}

impl Iterator for DocIdIter<'_> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        match self {
            DocIdIter::Bitmap(it) => it.next(),
            DocIdIter::Range(r) => r.next(),
            DocIdIter::Sorted(it) => it.next().copied(),
        }
    }
}

/// Doc ids produced by a filter operator.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterBlock {
    doc_ids: Option<DocIdSet>,
}

impl FilterBlock {
    pub fn new(doc_ids: Option<DocIdSet>) -> Self {
        Self { doc_ids }
    }
}

/// Access to one column's values.
#[derive(Debug, Clone)]
pub struct ColumnBlock {
    source: Arc<ColumnDataSource>,
}

#[derive(Debug, Clone)]
pub enum Block {
    SingleValueColumn(ColumnBlock),
    MultiValueColumn(ColumnBlock),
    Predicate(FilterBlock),
    And(FilterBlock),
    Or(FilterBlock),
    /// A chunk of filter output.
    DocIds(DocIdSet),
}

impl Block {
    pub fn column(source: Arc<ColumnDataSource>) -> Block {
        if source.is_single_value() {
            Block::SingleValueColumn(ColumnBlock { source })
        } else {
            Block::MultiValueColumn(ColumnBlock { source })
        }
    }
}

impl DocIdSource for Block {
    fn doc_id_set(&self) -> Option<DocIdSet> {
        match self {
            Block::SingleValueColumn(c) | Block::MultiValueColumn(c) => {
                Some(DocIdSet::Range(0..c.source.total_docs()))
            }
            Block::Predicate(f) | Block::And(f) | Block::Or(f) => f.doc_ids.clone(),
            Block::DocIds(ids) => Some(ids.clone()),
        }
    }
}

impl ValueSource for Block {
    fn value_set(&self) -> Result<ValueSet, QuarryError> {
        match self {
            Block::SingleValueColumn(c) | Block::MultiValueColumn(c) => Ok(ValueSet::new(Arc::clone(&c.source))),
            Block::Predicate(_) | Block::And(_) | Block::Or(_) | Block::DocIds(_) => Err(
                QuarryError::UnsupportedOperation("filter blocks carry doc ids only".to_string()),
            ),
        }
    }
}

/// Values of one column, read by doc id.
///
/// Single-value reads take a batch of doc ids; multi-value reads work one doc at a time and
/// write into a caller-owned buffer.
#[derive(Debug, Clone)]
pub struct ValueSet {
    source: Arc<ColumnDataSource>,
}

impl ValueSet {
    pub fn new(source: Arc<ColumnDataSource>) -> Self {
        Self { source }
    }

    pub fn column(&self) -> &ColumnDataSource {
        &self.source
    }

    pub fn is_single_value(&self) -> bool {
        self.source.is_single_value()
    }

    fn unsupported(&self, what: &str) -> QuarryError {
        QuarryError::UnsupportedOperation(format!("{} on column {}", what, self.source.name()))
    }

    /// Appends the dictionary id of each doc to `out`.
    pub fn dictionary_ids(&self, docs: &[u32], out: &mut Vec<u32>) -> Result<(), QuarryError> {
        match self.source.forward_index() {
            ForwardIndex::SingleValue(f) => f.read_dict_ids(docs, out),
            ForwardIndex::MultiValue(_) => Err(self.unsupported("single-value id read")),
            ForwardIndex::Raw(_) => Err(self.unsupported("dictionary id read without a dictionary")),
        }
    }

    pub fn values(&self, docs: &[u32], out: &mut Vec<Value>) -> Result<(), QuarryError> {
        match (self.source.forward_index(), self.source.dictionary()) {
            (ForwardIndex::Raw(raw), _) => raw.read_values(docs, out),
            (ForwardIndex::SingleValue(f), Some(dict)) => {
                out.reserve(docs.len());
                for &doc in docs {
                    out.push(dict.get(f.get(doc)?)?);
                }
                Ok(())
            }
            _ => Err(self.unsupported("single-value read")),
        }
    }

    pub fn doubles(&self, docs: &[u32], out: &mut Vec<f64>) -> Result<(), QuarryError> {
        match (self.source.forward_index(), self.source.dictionary()) {
            (ForwardIndex::Raw(raw), _) => raw.read_doubles(docs, out),
            (ForwardIndex::SingleValue(f), Some(dict)) => {
                out.reserve(docs.len());
                for &doc in docs {
                    out.push(dict.get_f64(f.get(doc)?)?);
                }
                Ok(())
            }
            _ => Err(self.unsupported("single-value numeric read")),
        }
    }

    /// Replaces `out` with the dictionary ids of `doc` and returns their count.
    /// Single-value dictionary columns answer with a one-element list.
    pub fn multi_value_ids(&self, doc: u32, out: &mut Vec<u32>) -> Result<usize, QuarryError> {
        match self.source.forward_index() {
            ForwardIndex::MultiValue(f) => f.read_into(doc, out),
            ForwardIndex::SingleValue(f) => {
                out.clear();
                out.push(f.get(doc)?);
                Ok(1)
            }
            ForwardIndex::Raw(_) => Err(self.unsupported("dictionary id read without a dictionary")),
        }
    }

    /// Appends the numeric values of `doc` to `out`; `ids` is scratch space.
    pub fn multi_value_doubles(&self, doc: u32, ids: &mut Vec<u32>, out: &mut Vec<f64>) -> Result<usize, QuarryError> {
        let dict = self
            .source
            .dictionary()
            .ok_or_else(|| self.unsupported("multi-value read without a dictionary"))?;
        let n = self.multi_value_ids(doc, ids)?;
        for &id in ids.iter() {
            out.push(dict.get_f64(id)?);
        }
        Ok(n)
    }

    pub fn multi_value_values(&self, doc: u32, ids: &mut Vec<u32>, out: &mut Vec<Value>) -> Result<usize, QuarryError> {
        let dict = self
            .source
            .dictionary()
            .ok_or_else(|| self.unsupported("multi-value read without a dictionary"))?;
        let n = self.multi_value_ids(doc, ids)?;
        for &id in ids.iter() {
            out.push(dict.get(id)?);
        }
        Ok(n)
    }

    /// One value per advance of `docs`.
    pub fn iter<'a>(&'a self, docs: DocIdIter<'a>) -> SingleValueIter<'a> {
        SingleValueIter { values: self, docs }
    }

    /// One id array per advance of `docs`.
    pub fn multi_value_iter<'a>(&'a self, docs: DocIdIter<'a>) -> MultiValueIter<'a> {
        MultiValueIter { values: self, docs }
    }
}

pub struct SingleValueIter<'a> {
    values: &'a ValueSet,
    docs: DocIdIter<'a>,
}

impl Iterator for SingleValueIter<'_> {
    type Item = Result<Value, QuarryError>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = self.docs.next()?;
        let source = &self.values.source;
        Some(match (source.forward_index(), source.dictionary()) {
            (ForwardIndex::Raw(raw), _) => raw.get_value(doc),
            (ForwardIndex::SingleValue(f), Some(dict)) => f.get(doc).and_then(|id| dict.get(id)),
            _ => Err(self.values.unsupported("single-value iteration")),
        })
    }
}

pub struct MultiValueIter<'a> {
    values: &'a ValueSet,
    docs: DocIdIter<'a>,
}

impl MultiValueIter<'_> {
    /// Reads the next doc's ids into `buf`; returns `(doc, count)` or `None` at the end.
    pub fn next_into(&mut self, buf: &mut Vec<u32>) -> Result<Option<(u32, usize)>, QuarryError> {
        match self.docs.next() {
            Some(doc) => Ok(Some((doc, self.values.multi_value_ids(doc, buf)?))),
            None => Ok(None),
        }
    }
}
