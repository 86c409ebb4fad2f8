use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::QuarryError;

/// Stored data type of a column. Serde: lowercase string (e.g. `"long"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Long,
    Float,
    Double,
    String,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::String)
    }

    pub fn is_integral(self) -> bool {
        matches!(self, DataType::Int | DataType::Long)
    }

    /// Width in bytes of one value in fixed-width encodings; `None` for strings.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::Int | DataType::Float => Some(4),
            DataType::Long | DataType::Double => Some(8),
            DataType::String => None,
        }
    }

    /// Placeholder stored for a column missing from an input row.
    pub fn default_null_value(self) -> Value {
        match self {
            DataType::Int => Value::Int(0),
            DataType::Long => Value::Long(0),
            DataType::Float => Value::Float(0.0),
            DataType::Double => Value::Double(0.0),
            DataType::String => Value::String("null".to_string()),
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            DataType::Int => 0,
            DataType::Long => 1,
            DataType::Float => 2,
            DataType::Double => 3,
            DataType::String => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DataType::Int),
            1 => Some(DataType::Long),
            2 => Some(DataType::Float),
            3 => Some(DataType::Double),
            4 => Some(DataType::String),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Int => "int",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
        };
        f.write_str(s)
    }
}

/// Role of a column in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Dimension,
    Metric,
    Time,
}

fn default_single_value() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub data_type: DataType,
    pub field_type: FieldType,
    #[serde(default = "default_single_value")]
    pub single_value: bool,
}

impl FieldSpec {
    pub fn dimension(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            field_type: FieldType::Dimension,
            single_value: true,
        }
    }

    pub fn multi_value_dimension(name: &str, data_type: DataType) -> Self {
        Self {
            single_value: false,
            ..Self::dimension(name, data_type)
        }
    }

    pub fn metric(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            field_type: FieldType::Metric,
            single_value: true,
        }
    }

    pub fn time(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            field_type: FieldType::Time,
            single_value: true,
        }
    }
}

/// Ordered list of column definitions for a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn with_dimension(self, name: &str, data_type: DataType) -> Self {
        self.with_field(FieldSpec::dimension(name, data_type))
    }

    pub fn with_multi_value_dimension(self, name: &str, data_type: DataType) -> Self {
        self.with_field(FieldSpec::multi_value_dimension(name, data_type))
    }

    pub fn with_metric(self, name: &str, data_type: DataType) -> Self {
        self.with_field(FieldSpec::metric(name, data_type))
    }

    pub fn with_time(self, name: &str, data_type: DataType) -> Self {
        self.with_field(FieldSpec::time(name, data_type))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The first column declared with `FieldType::Time`, if any.
    pub fn time_column(&self) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.field_type == FieldType::Time)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rejects empty schemas, empty or duplicate column names, and multi-valued time columns.
    pub fn validate(&self) -> Result<(), QuarryError> {
        if self.fields.is_empty() {
            return Err(QuarryError::ConfigError("Schema has no columns".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.fields {
            if f.name.is_empty() {
                return Err(QuarryError::ConfigError("Empty column name in schema".to_string()));
            }
            if f.name.contains('/') || f.name.contains('\\') || f.name.starts_with('.') {
                return Err(QuarryError::ConfigError(format!(
                    "Column name {:?} cannot be used as a file name",
                    f.name
                )));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(QuarryError::ConfigError(format!("Duplicate column {:?}", f.name)));
            }
            if f.field_type == FieldType::Time && !f.single_value {
                return Err(QuarryError::ConfigError(format!(
                    "Time column {:?} must be single-valued",
                    f.name
                )));
            }
        }
        Ok(())
    }
}

/// A single column value.
///
/// Values of one type are totally ordered (floats by `total_cmp`), which is the order used
/// for dictionaries. Values of different types order by type first; callers coerce to the
/// column type before comparing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Long(_) => DataType::Long,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
        }
    }

    /// Numeric view of the value; `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to `target`, parsing strings and converting between numeric types.
    ///
    /// Narrowing conversions fail instead of truncating: `Long(1 << 40)` does not fit an int and
    /// `Double(2.5)` is not an integer.
    pub fn coerce_to(&self, target: DataType) -> Result<Value, String> {
        if self.data_type() == target {
            return Ok(self.clone());
        }
        match (target, self) {
            (DataType::String, v) => Ok(Value::String(v.to_string())),
            (DataType::Int, Value::String(s)) => s
                .trim()
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|e| format!("cannot parse {:?} as int: {}", s, e)),
            (DataType::Long, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|e| format!("cannot parse {:?} as long: {}", s, e)),
            (DataType::Float, Value::String(s)) => s
                .trim()
                .parse::<f32>()
                .map(Value::Float)
                .map_err(|e| format!("cannot parse {:?} as float: {}", s, e)),
            (DataType::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| format!("cannot parse {:?} as double: {}", s, e)),
            (DataType::Int, v) => {
                let i = integral(v)?;
                i32::try_from(i)
                    .map(Value::Int)
                    .map_err(|_| format!("{} does not fit in an int", v))
            }
            (DataType::Long, v) => integral(v).map(Value::Long),
            (DataType::Float, v) => v
                .as_f64()
                .map(|f| Value::Float(f as f32))
                .ok_or_else(|| format!("{} is not numeric", v)),
            (DataType::Double, v) => v
                .as_f64()
                .map(Value::Double)
                .ok_or_else(|| format!("{} is not numeric", v)),
        }
    }

    fn type_rank(&self) -> u8 {
        self.data_type().tag()
    }
}

fn integral(v: &Value) -> Result<i64, String> {
    match v {
        Value::Int(i) => Ok(*i as i64),
        Value::Long(l) => Ok(*l),
        Value::Float(_) | Value::Double(_) => {
            let f = v.as_f64().unwrap_or(f64::NAN);
            if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(f as i64)
            } else {
                Err(format!("{} is not an integer", v))
            }
        }
        Value::String(s) => Err(format!("{:?} is not numeric", s)),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// The value(s) of one column in one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Single(Value),
    Multi(Vec<Value>),
}

impl RowValue {
    pub fn values(&self) -> &[Value] {
        match self {
            RowValue::Single(v) => std::slice::from_ref(v),
            RowValue::Multi(vs) => vs,
        }
    }
}

/// One input row: column name → value(s).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericRow {
    fields: HashMap<String, RowValue>,
}

impl GenericRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_single(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.insert(column, RowValue::Single(value.into()));
        self
    }

    pub fn with_multi<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.insert(column, RowValue::Multi(values));
        self
    }

    pub fn insert(&mut self, column: &str, value: RowValue) {
        self.fields.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&RowValue> {
        self.fields.get(column)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
