//! First pass of segment creation: per-column statistics over every input row.
//!
//! The collectors see each value after it has been normalized to the column's type, so the
//! sorted unique set they produce is exactly the dictionary the second pass encodes against.

use crate::error::QuarryError;
use crate::types::{DataType, FieldSpec, GenericRow, RowValue, Schema, Value};

use std::collections::BTreeSet;

/// The values a column stores for one row: coerced to the column type, with missing values
/// and empty multi-value lists replaced by the type's default null value.
pub(crate) fn normalize(field: &FieldSpec, raw: Option<&RowValue>) -> Result<Vec<Value>, QuarryError> {
    let invalid = |details: String| QuarryError::InvalidValue {
        column: field.name.clone(),
        details,
    };
    let values: &[Value] = match raw {
        None => &[],
        Some(RowValue::Single(v)) => std::slice::from_ref(v),
        Some(RowValue::Multi(vs)) if field.single_value => {
            if vs.len() > 1 {
                return Err(invalid(format!("{} values for a single-value column", vs.len())));
            }
            vs
        }
        Some(RowValue::Multi(vs)) => vs,
    };
    if values.is_empty() {
        return Ok(vec![field.data_type.default_null_value()]);
    }
    values
        .iter()
        .map(|v| v.coerce_to(field.data_type).map_err(invalid))
        .collect()
}

/// Sealed statistics of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStatistics {
    pub name: String,
    pub data_type: DataType,
    /// Distinct values ascending; empty when uniques were not tracked.
    pub sorted_uniques: Vec<Value>,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub sorted: bool,
    pub max_number_of_multi_values: u32,
    pub total_number_of_entries: u64,
    pub string_column_max_length: u32,
    pub total_docs: u32,
}

impl ColumnStatistics {
    pub fn cardinality(&self) -> u32 {
        self.sorted_uniques.len() as u32
    }
}

#[derive(Debug)]
pub struct ColumnStatsCollector {
    field: FieldSpec,
    track_uniques: bool,
    uniques: BTreeSet<Value>,
    min: Option<Value>,
    max: Option<Value>,
    previous: Option<Value>,
    sorted: bool,
    max_multi_values: u32,
    total_entries: u64,
    max_string_length: u32,
    total_docs: u32,
}

impl ColumnStatsCollector {
    /// `track_uniques` is false for columns stored without a dictionary.
    pub fn new(field: &FieldSpec, track_uniques: bool) -> Self {
        Self {
            field: field.clone(),
            track_uniques,
            uniques: BTreeSet::new(),
            min: None,
            max: None,
            previous: None,
            sorted: field.single_value,
            max_multi_values: 0,
            total_entries: 0,
            max_string_length: 0,
            total_docs: 0,
        }
    }

    pub fn field(&self) -> &FieldSpec {
        &self.field
    }

    /// Records the (already normalized) values of the next row.
    pub fn collect(&mut self, values: &[Value]) -> Result<(), QuarryError> {
        if self.total_docs == u32::MAX {
            return Err(QuarryError::InvalidValue {
                column: self.field.name.clone(),
                details: "too many rows for one segment".to_string(),
            });
        }
        self.total_docs += 1;
        self.total_entries += values.len() as u64;
        self.max_multi_values = self.max_multi_values.max(values.len() as u32);

        for v in values {
            if let Value::String(s) = v {
                self.max_string_length = self.max_string_length.max(s.len() as u32);
            }
            if self.min.as_ref().map_or(true, |m| v < m) {
                self.min = Some(v.clone());
            }
            if self.max.as_ref().map_or(true, |m| v > m) {
                self.max = Some(v.clone());
            }
            if self.track_uniques && !self.uniques.contains(v) {
                self.uniques.insert(v.clone());
            }
        }

        if self.field.single_value {
            if let Some(v) = values.first() {
                if let Some(prev) = &self.previous {
                    if v < prev {
                        self.sorted = false;
                    }
                }
                self.previous = Some(v.clone());
            }
        }
        Ok(())
    }

    pub fn seal(self) -> ColumnStatistics {
        ColumnStatistics {
            name: self.field.name,
            data_type: self.field.data_type,
            sorted_uniques: self.uniques.into_iter().collect(),
            min_value: self.min,
            max_value: self.max,
            sorted: self.sorted,
            max_number_of_multi_values: self.max_multi_values,
            total_number_of_entries: self.total_entries,
            string_column_max_length: self.max_string_length,
            total_docs: self.total_docs,
        }
    }
}

/// One collector per schema column, fed whole rows.
#[derive(Debug)]
pub struct SegmentStatsCollector {
    columns: Vec<ColumnStatsCollector>,
    total_docs: u32,
}

impl SegmentStatsCollector {
    /// `no_dictionary` names the columns that will be stored raw.
    pub fn new(schema: &Schema, no_dictionary: &[String]) -> Self {
        let columns = schema
            .fields
            .iter()
            .map(|f| ColumnStatsCollector::new(f, !no_dictionary.contains(&f.name)))
            .collect();
        Self { columns, total_docs: 0 }
    }

    pub fn collect_row(&mut self, row: &GenericRow) -> Result<(), QuarryError> {
        for c in &mut self.columns {
            let values = normalize(c.field(), row.get(&c.field().name))?;
            c.collect(&values)?;
        }
        self.total_docs += 1;
        Ok(())
    }

    pub fn total_docs(&self) -> u32 {
        self.total_docs
    }

    /// Sealed statistics in schema order.
    pub fn seal(self) -> Vec<ColumnStatistics> {
        self.columns.into_iter().map(ColumnStatsCollector::seal).collect()
    }
}
