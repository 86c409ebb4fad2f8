//! Aggregation functions, their mergeable partial results, and the plain (non-grouped)
//! aggregation executor.

use crate::block::{Block, ValueSet, ValueSource};
use crate::error::QuarryError;
use crate::loader::ImmutableSegment;
use crate::types::Value;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Every supported aggregation. Names parse case-insensitively via [`AggregationFunction::from_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    MinMaxRange,
    DistinctCount,
    CountMv,
    SumMv,
    MinMv,
    MaxMv,
    AvgMv,
    DistinctCountMv,
}

const ALL_FUNCTIONS: [AggregationFunction; 13] = [
    AggregationFunction::Count,
    AggregationFunction::Sum,
    AggregationFunction::Min,
    AggregationFunction::Max,
    AggregationFunction::Avg,
    AggregationFunction::MinMaxRange,
    AggregationFunction::DistinctCount,
    AggregationFunction::CountMv,
    AggregationFunction::SumMv,
    AggregationFunction::MinMv,
    AggregationFunction::MaxMv,
    AggregationFunction::AvgMv,
    AggregationFunction::DistinctCountMv,
];

/// What a function reads from its column for each doc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputKind {
    /// Nothing: one unit per doc.
    Docs,
    Doubles,
    Values,
    MultiLengths,
    MultiDoubles,
    MultiValues,
}

impl AggregationFunction {
    pub fn from_name(name: &str) -> Result<Self, QuarryError> {
        let lower = name.to_ascii_lowercase();
        ALL_FUNCTIONS
            .iter()
            .copied()
            .find(|f| f.name() == lower)
            .ok_or_else(|| QuarryError::InvalidQuery(format!("unknown aggregation function {:?}", name)))
    }

    pub fn name(self) -> &'static str {
        match self {
            AggregationFunction::Count => "count",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
            AggregationFunction::Avg => "avg",
            AggregationFunction::MinMaxRange => "minmaxrange",
            AggregationFunction::DistinctCount => "distinctcount",
            AggregationFunction::CountMv => "countmv",
            AggregationFunction::SumMv => "summv",
            AggregationFunction::MinMv => "minmv",
            AggregationFunction::MaxMv => "maxmv",
            AggregationFunction::AvgMv => "avgmv",
            AggregationFunction::DistinctCountMv => "distinctcountmv",
        }
    }

    pub fn is_multi_value(self) -> bool {
        matches!(
            self,
            AggregationFunction::CountMv
                | AggregationFunction::SumMv
                | AggregationFunction::MinMv
                | AggregationFunction::MaxMv
                | AggregationFunction::AvgMv
                | AggregationFunction::DistinctCountMv
        )
    }

    /// `count` ignores its column; every other function reads one.
    pub fn needs_column(self) -> bool {
        self != AggregationFunction::Count
    }

    fn needs_numeric(self) -> bool {
        !matches!(
            self,
            AggregationFunction::Count
                | AggregationFunction::DistinctCount
                | AggregationFunction::CountMv
                | AggregationFunction::DistinctCountMv
        )
    }

    pub(crate) fn input_kind(self) -> InputKind {
        use AggregationFunction::*;
        match self {
            Count => InputKind::Docs,
            Sum | Min | Max | Avg | MinMaxRange => InputKind::Doubles,
            DistinctCount => InputKind::Values,
            CountMv => InputKind::MultiLengths,
            SumMv | MinMv | MaxMv | AvgMv => InputKind::MultiDoubles,
            DistinctCountMv => InputKind::MultiValues,
        }
    }

    /// The identity partial.
    pub fn init(self) -> IntermediateResult {
        use AggregationFunction::*;
        match self {
            Count | CountMv => IntermediateResult::Count(0),
            Sum | SumMv => IntermediateResult::Sum(0.0),
            Min | MinMv => IntermediateResult::Min(None),
            Max | MaxMv => IntermediateResult::Max(None),
            Avg | AvgMv => IntermediateResult::Avg { sum: 0.0, count: 0 },
            MinMaxRange => IntermediateResult::MinMax { min: None, max: None },
            DistinctCount | DistinctCountMv => IntermediateResult::Distinct(BTreeSet::new()),
        }
    }

    /// Folds `input` into `acc`.
    pub fn accumulate(self, acc: &mut IntermediateResult, input: AggregationInput<'_>) -> Result<(), QuarryError> {
        match (acc, input) {
            (IntermediateResult::Count(n), AggregationInput::Count(k)) => *n += k,
            (IntermediateResult::Sum(s), AggregationInput::Doubles(xs)) => *s += xs.iter().sum::<f64>(),
            (IntermediateResult::Min(m), AggregationInput::Doubles(xs)) => {
                for &x in xs {
                    *m = Some(m.map_or(x, |c| c.min(x)));
                }
            }
            (IntermediateResult::Max(m), AggregationInput::Doubles(xs)) => {
                for &x in xs {
                    *m = Some(m.map_or(x, |c| c.max(x)));
                }
            }
            (IntermediateResult::Avg { sum, count }, AggregationInput::Doubles(xs)) => {
                *sum += xs.iter().sum::<f64>();
                *count += xs.len() as u64;
            }
            (IntermediateResult::MinMax { min, max }, AggregationInput::Doubles(xs)) => {
                for &x in xs {
                    *min = Some(min.map_or(x, |c| c.min(x)));
                    *max = Some(max.map_or(x, |c| c.max(x)));
                }
            }
            (IntermediateResult::Distinct(set), AggregationInput::Values(vs)) => {
                set.extend(vs.iter().cloned());
            }
            (acc, input) => {
                return Err(QuarryError::Internal(format!(
                    "{} cannot fold {:?} into {:?}",
                    self.name(),
                    input,
                    acc
                )))
            }
        }
        Ok(())
    }

    /// Partial result for one batch of inputs.
    pub fn aggregate(self, input: AggregationInput<'_>) -> Result<IntermediateResult, QuarryError> {
        let mut acc = self.init();
        self.accumulate(&mut acc, input)?;
        Ok(acc)
    }

    /// Merges two partials; commutative and associative.
    pub fn combine(self, a: IntermediateResult, b: IntermediateResult) -> Result<IntermediateResult, QuarryError> {
        let mut a = a;
        a.merge(b)?;
        Ok(a)
    }

    /// Merges all partials and produces the final value.
    pub fn reduce(self, partials: Vec<IntermediateResult>) -> Result<FinalValue, QuarryError> {
        let mut acc = self.init();
        for p in partials {
            acc.merge(p)?;
        }
        Ok(acc.finalize())
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One batch of input for [`AggregationFunction::accumulate`].
#[derive(Debug, Clone, Copy)]
pub enum AggregationInput<'a> {
    Count(u64),
    Doubles(&'a [f64]),
    Values(&'a [Value]),
}

/// Mergeable partial state of one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntermediateResult {
    Count(u64),
    Sum(f64),
    Min(Option<f64>),
    Max(Option<f64>),
    Avg { sum: f64, count: u64 },
    MinMax { min: Option<f64>, max: Option<f64> },
    Distinct(BTreeSet<Value>),
}

fn merge_opt(a: &mut Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) {
    *a = match (*a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (x, y) => x.or(y),
    };
}

impl IntermediateResult {
    pub fn merge(&mut self, other: IntermediateResult) -> Result<(), QuarryError> {
        match (self, other) {
            (IntermediateResult::Count(a), IntermediateResult::Count(b)) => *a += b,
            (IntermediateResult::Sum(a), IntermediateResult::Sum(b)) => *a += b,
            (IntermediateResult::Min(a), IntermediateResult::Min(b)) => merge_opt(a, b, f64::min),
            (IntermediateResult::Max(a), IntermediateResult::Max(b)) => merge_opt(a, b, f64::max),
            (IntermediateResult::Avg { sum, count }, IntermediateResult::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (IntermediateResult::MinMax { min, max }, IntermediateResult::MinMax { min: lo, max: hi }) => {
                merge_opt(min, lo, f64::min);
                merge_opt(max, hi, f64::max);
            }
            (IntermediateResult::Distinct(a), IntermediateResult::Distinct(b)) => {
                if a.len() < b.len() {
                    let small = std::mem::replace(a, b);
                    a.extend(small);
                } else {
                    a.extend(b);
                }
            }
            (a, b) => {
                return Err(QuarryError::Internal(format!(
                    "cannot merge partial {:?} with {:?}",
                    a, b
                )))
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> FinalValue {
        match self {
            IntermediateResult::Count(n) => FinalValue::Long(*n as i64),
            IntermediateResult::Sum(s) => FinalValue::Double(*s),
            IntermediateResult::Min(m) | IntermediateResult::Max(m) => m.map_or(FinalValue::Null, FinalValue::Double),
            IntermediateResult::Avg { sum, count } => {
                if *count == 0 {
                    FinalValue::Null
                } else {
                    FinalValue::Double(sum / *count as f64)
                }
            }
            IntermediateResult::MinMax { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => FinalValue::Double(hi - lo),
                _ => FinalValue::Null,
            },
            IntermediateResult::Distinct(set) => FinalValue::Long(set.len() as i64),
        }
    }
}

/// Final value of an aggregation. Serializes as a bare JSON number or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalValue {
    Long(i64),
    Double(f64),
    Null,
}

impl FinalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FinalValue::Long(v) => Some(*v as f64),
            FinalValue::Double(v) => Some(*v),
            FinalValue::Null => None,
        }
    }
}

impl fmt::Display for FinalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalValue::Long(v) => write!(f, "{}", v),
            FinalValue::Double(v) => write!(f, "{}", v),
            FinalValue::Null => f.write_str("null"),
        }
    }
}

/// One requested aggregation: a function and the column it reads (ignored for `count`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub function: AggregationFunction,
    #[serde(default)]
    pub column: Option<String>,
}

impl AggregationSpec {
    pub fn new(function: AggregationFunction, column: &str) -> Self {
        Self {
            function,
            column: Some(column.to_string()),
        }
    }

    pub fn count() -> Self {
        Self {
            function: AggregationFunction::Count,
            column: None,
        }
    }

    /// Result label, e.g. `sum(clicks)` or `count(*)`.
    pub fn label(&self) -> String {
        match (&self.column, self.function.needs_column()) {
            (Some(c), true) => format!("{}({})", self.function, c),
            _ => format!("{}(*)", self.function),
        }
    }
}

/// An aggregation bound to the column readers of one segment.
#[derive(Debug, Clone)]
pub(crate) struct BoundAggregation {
    pub(crate) function: AggregationFunction,
    values: Option<ValueSet>,
}

/// Per-block column data for one bound aggregation. Multi-value variants keep `n + 1`
/// offsets into the flattened values.
#[derive(Debug)]
pub(crate) enum BlockValues {
    Docs(usize),
    Doubles(Vec<f64>),
    Values(Vec<Value>),
    MultiLengths(Vec<usize>),
    MultiDoubles { offsets: Vec<usize>, values: Vec<f64> },
    MultiValues { offsets: Vec<usize>, values: Vec<Value> },
}

impl BlockValues {
    pub(crate) fn for_doc(&self, i: usize) -> AggregationInput<'_> {
        match self {
            BlockValues::Docs(_) => AggregationInput::Count(1),
            BlockValues::Doubles(v) => AggregationInput::Doubles(&v[i..i + 1]),
            BlockValues::Values(v) => AggregationInput::Values(&v[i..i + 1]),
            BlockValues::MultiLengths(o) => AggregationInput::Count((o[i + 1] - o[i]) as u64),
            BlockValues::MultiDoubles { offsets, values } => AggregationInput::Doubles(&values[offsets[i]..offsets[i + 1]]),
            BlockValues::MultiValues { offsets, values } => AggregationInput::Values(&values[offsets[i]..offsets[i + 1]]),
        }
    }

    pub(crate) fn all(&self) -> AggregationInput<'_> {
        match self {
            BlockValues::Docs(n) => AggregationInput::Count(*n as u64),
            BlockValues::Doubles(v) => AggregationInput::Doubles(v),
            BlockValues::Values(v) => AggregationInput::Values(v),
            BlockValues::MultiLengths(o) => AggregationInput::Count(o.last().copied().unwrap_or(0) as u64),
            BlockValues::MultiDoubles { values, .. } => AggregationInput::Doubles(values),
            BlockValues::MultiValues { values, .. } => AggregationInput::Values(values),
        }
    }

    /// Entries read from the column (docs for single-value inputs).
    pub(crate) fn entries(&self) -> u64 {
        match self {
            BlockValues::Docs(_) => 0,
            BlockValues::Doubles(v) => v.len() as u64,
            BlockValues::Values(v) => v.len() as u64,
            BlockValues::MultiLengths(o) | BlockValues::MultiDoubles { offsets: o, .. } | BlockValues::MultiValues { offsets: o, .. } => {
                o.last().copied().unwrap_or(0) as u64
            }
        }
    }
}

impl BoundAggregation {
    /// Resolves and validates the column of `spec` against `segment`.
    pub(crate) fn bind(spec: &AggregationSpec, segment: &ImmutableSegment) -> Result<Self, QuarryError> {
        let function = spec.function;
        if !function.needs_column() {
            return Ok(Self { function, values: None });
        }
        let column = spec
            .column
            .as_deref()
            .ok_or_else(|| QuarryError::InvalidQuery(format!("{} needs a column", function)))?;
        let source = segment
            .data_source(column)
            .ok_or_else(|| QuarryError::InvalidQuery(format!("unknown aggregation column {}", column)))?;
        if function.is_multi_value() == source.is_single_value() {
            return Err(QuarryError::InvalidQuery(format!(
                "{} does not apply to {} column {}",
                function,
                if source.is_single_value() { "single-value" } else { "multi-value" },
                column
            )));
        }
        if function.needs_numeric() && !source.metadata().data_type.is_numeric() {
            return Err(QuarryError::InvalidQuery(format!(
                "{} needs a numeric column, {} is {}",
                function,
                column,
                source.metadata().data_type
            )));
        }
        Ok(Self {
            function,
            values: Some(Block::column(source).value_set()?),
        })
    }

    pub(crate) fn fetch(&self, docs: &[u32]) -> Result<BlockValues, QuarryError> {
        let Some(vs) = &self.values else {
            return Ok(BlockValues::Docs(docs.len()));
        };
        let mut ids = Vec::new();
        let mut offsets = Vec::with_capacity(docs.len() + 1);
        offsets.push(0usize);
        Ok(match self.function.input_kind() {
            InputKind::Docs => BlockValues::Docs(docs.len()),
            InputKind::Doubles => {
                let mut out = Vec::with_capacity(docs.len());
                vs.doubles(docs, &mut out)?;
                BlockValues::Doubles(out)
            }
            InputKind::Values => {
                let mut out = Vec::with_capacity(docs.len());
                vs.values(docs, &mut out)?;
                BlockValues::Values(out)
            }
            InputKind::MultiLengths => {
                let mut total = 0;
                for &doc in docs {
                    total += vs.multi_value_ids(doc, &mut ids)?;
                    offsets.push(total);
                }
                BlockValues::MultiLengths(offsets)
            }
            InputKind::MultiDoubles => {
                let mut values = Vec::new();
                for &doc in docs {
                    vs.multi_value_doubles(doc, &mut ids, &mut values)?;
                    offsets.push(values.len());
                }
                BlockValues::MultiDoubles { offsets, values }
            }
            InputKind::MultiValues => {
                let mut values = Vec::new();
                for &doc in docs {
                    vs.multi_value_values(doc, &mut ids, &mut values)?;
                    offsets.push(values.len());
                }
                BlockValues::MultiValues { offsets, values }
            }
        })
    }
}

/// Running partials of a plain aggregation, one per requested function.
#[derive(Debug, Clone)]
pub struct AggregationResultHolder {
    results: Vec<IntermediateResult>,
}

impl AggregationResultHolder {
    pub fn new(functions: &[AggregationFunction]) -> Self {
        Self {
            results: functions.iter().map(|f| f.init()).collect(),
        }
    }

    pub fn results(&self) -> &[IntermediateResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<IntermediateResult> {
        self.results
    }
}

/// Aggregation without grouping: each `DocIds` block is read once per aggregation.
#[derive(Debug)]
pub struct AggregationExecutor {
    aggregations: Vec<BoundAggregation>,
    holder: AggregationResultHolder,
    docs_scanned: u64,
    entries_scanned: u64,
}

impl AggregationExecutor {
    pub fn new(specs: &[AggregationSpec], segment: &ImmutableSegment) -> Result<Self, QuarryError> {
        let aggregations = specs
            .iter()
            .map(|s| BoundAggregation::bind(s, segment))
            .collect::<Result<Vec<_>, _>>()?;
        let functions: Vec<_> = aggregations.iter().map(|a| a.function).collect();
        Ok(Self {
            holder: AggregationResultHolder::new(&functions),
            aggregations,
            docs_scanned: 0,
            entries_scanned: 0,
        })
    }

    pub fn aggregate_block(&mut self, docs: &[u32]) -> Result<(), QuarryError> {
        self.docs_scanned += docs.len() as u64;
        for (agg, acc) in self.aggregations.iter().zip(self.holder.results.iter_mut()) {
            let values = agg.fetch(docs)?;
            self.entries_scanned += values.entries();
            agg.function.accumulate(acc, values.all())?;
        }
        Ok(())
    }

    pub fn docs_scanned(&self) -> u64 {
        self.docs_scanned
    }

    pub fn entries_scanned(&self) -> u64 {
        self.entries_scanned
    }

    pub fn finish(self) -> AggregationResultHolder {
        self.holder
    }
}
