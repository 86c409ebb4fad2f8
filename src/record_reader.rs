//! Row producers for segment creation.
//!
//! Creation reads its input twice (statistics, then index build), so every reader must be
//! able to [`rewind`](RecordReader::rewind) to the first row.

use crate::error::QuarryError;
use crate::types::{GenericRow, RowValue, Schema, Value};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub trait RecordReader {
    fn schema(&self) -> &Schema;

    /// The next row, or `None` once the input is exhausted.
    fn next_row(&mut self) -> Result<Option<GenericRow>, QuarryError>;

    /// Restarts from the first row.
    fn rewind(&mut self) -> Result<(), QuarryError>;
}

impl<R: RecordReader + ?Sized> RecordReader for Box<R> {
    fn schema(&self) -> &Schema {
        (**self).schema()
    }

    fn next_row(&mut self) -> Result<Option<GenericRow>, QuarryError> {
        (**self).next_row()
    }

    fn rewind(&mut self) -> Result<(), QuarryError> {
        (**self).rewind()
    }
}

/// Rows held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryRecordReader {
    schema: Schema,
    rows: Vec<GenericRow>,
    next: usize,
}

impl InMemoryRecordReader {
    pub fn new(schema: Schema, rows: Vec<GenericRow>) -> Self {
        Self { schema, rows, next: 0 }
    }
}

impl RecordReader for InMemoryRecordReader {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<GenericRow>, QuarryError> {
        let row = self.rows.get(self.next).cloned();
        if row.is_some() {
            self.next += 1;
        }
        Ok(row)
    }

    fn rewind(&mut self) -> Result<(), QuarryError> {
        self.next = 0;
        Ok(())
    }
}

/// One JSON object per line. Numbers, strings and arrays of them map onto column values;
/// `null` and absent keys leave the column missing. Blank lines are skipped.
#[derive(Debug)]
pub struct JsonLinesRecordReader {
    schema: Schema,
    path: PathBuf,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonLinesRecordReader {
    pub fn open(path: &Path, schema: Schema) -> Result<Self, QuarryError> {
        let lines = BufReader::new(File::open(path)?).lines();
        Ok(Self {
            schema,
            path: path.to_path_buf(),
            lines,
            line_no: 0,
        })
    }

    fn parse_line(&self, line: &str) -> Result<GenericRow, QuarryError> {
        let bad = |details: String| {
            QuarryError::Serialization(format!("{}:{}: {}", self.path.display(), self.line_no, details))
        };
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(line).map_err(|e| bad(e.to_string()))?;
        let mut row = GenericRow::new();
        for field in &self.schema.fields {
            let Some(json) = object.get(&field.name) else {
                continue;
            };
            let value = match json {
                serde_json::Value::Null => continue,
                serde_json::Value::Array(items) => RowValue::Multi(
                    items
                        .iter()
                        .filter(|v| !v.is_null())
                        .map(|v| scalar(v).map_err(|d| bad(format!("column {}: {}", field.name, d))))
                        .collect::<Result<_, _>>()?,
                ),
                other => RowValue::Single(scalar(other).map_err(|d| bad(format!("column {}: {}", field.name, d)))?),
            };
            row.insert(&field.name, value);
        }
        Ok(row)
    }
}

fn scalar(json: &serde_json::Value) -> Result<Value, String> {
    match json {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Long)
            .or_else(|| n.as_f64().map(Value::Double))
            .ok_or_else(|| format!("unrepresentable number {}", n)),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Bool(b) => Ok(Value::String(b.to_string())),
        other => Err(format!("unsupported JSON value {}", other)),
    }
}

impl RecordReader for JsonLinesRecordReader {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<GenericRow>, QuarryError> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            let line = line?;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return self.parse_line(&line).map(Some);
        }
    }

    fn rewind(&mut self) -> Result<(), QuarryError> {
        self.lines = BufReader::new(File::open(&self.path)?).lines();
        self.line_no = 0;
        Ok(())
    }
}

/// Supported input file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Newline-delimited JSON objects.
    #[default]
    Json,
}

impl std::str::FromStr for InputFormat {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "ndjson" => Ok(InputFormat::Json),
            other => Err(QuarryError::ConfigError(format!("unknown input format {:?}", other))),
        }
    }
}

pub fn open_record_reader(
    format: InputFormat,
    path: &Path,
    schema: Schema,
) -> Result<Box<dyn RecordReader>, QuarryError> {
    match format {
        InputFormat::Json => Ok(Box::new(JsonLinesRecordReader::open(path, schema)?)),
    }
}
