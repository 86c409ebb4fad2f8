//! Sorted per-column dictionaries: a bijection between distinct values and dense ids
//! `0..cardinality`, where id `i` is the `i`-th smallest value.

use crate::encoding::{read_u32, read_u8, seal_with_crc, verify_trailing_crc, write_u32};
use crate::error::QuarryError;
use crate::types::{DataType, Value};

use std::cmp::Ordering;
use std::io::{Cursor, Read};
use std::ops::{Bound, Range};
use std::path::Path;

/// Dictionary file magic bytes.
pub const DICT_MAGIC: &[u8; 8] = b"QRYDICT1";
const DICT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
enum DictValues {
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Dictionary {
    values: DictValues,
}

impl Dictionary {
    /// Builds a dictionary from distinct values already sorted ascending.
    pub fn from_sorted_values(data_type: DataType, values: &[Value]) -> Result<Self, QuarryError> {
        fn collect<T>(
            values: &[Value],
            data_type: DataType,
            pick: impl Fn(&Value) -> Option<T>,
        ) -> Result<Vec<T>, QuarryError> {
            values
                .iter()
                .map(|v| {
                    pick(v).ok_or_else(|| {
                        QuarryError::Internal(format!(
                            "Dictionary of type {} given a {} value",
                            data_type,
                            v.data_type()
                        ))
                    })
                })
                .collect()
        }

        let values = match data_type {
            DataType::Int => DictValues::Int(collect(values, data_type, |v| match v {
                Value::Int(x) => Some(*x),
                _ => None,
            })?),
            DataType::Long => DictValues::Long(collect(values, data_type, |v| match v {
                Value::Long(x) => Some(*x),
                _ => None,
            })?),
            DataType::Float => DictValues::Float(collect(values, data_type, |v| match v {
                Value::Float(x) => Some(*x),
                _ => None,
            })?),
            DataType::Double => DictValues::Double(collect(values, data_type, |v| match v {
                Value::Double(x) => Some(*x),
                _ => None,
            })?),
            DataType::String => DictValues::String(collect(values, data_type, |v| match v {
                Value::String(x) => Some(x.clone()),
                _ => None,
            })?),
        };
        let dict = Dictionary { values };
        dict.check_strictly_ascending()
            .map_err(QuarryError::Internal)?;
        Ok(dict)
    }

    pub fn data_type(&self) -> DataType {
        match &self.values {
            DictValues::Int(_) => DataType::Int,
            DictValues::Long(_) => DataType::Long,
            DictValues::Float(_) => DataType::Float,
            DictValues::Double(_) => DataType::Double,
            DictValues::String(_) => DataType::String,
        }
    }

    /// Cardinality of the column.
    pub fn len(&self) -> u32 {
        let n = match &self.values {
            DictValues::Int(v) => v.len(),
            DictValues::Long(v) => v.len(),
            DictValues::Float(v) => v.len(),
            DictValues::Double(v) => v.len(),
            DictValues::String(v) => v.len(),
        };
        n as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u32) -> Result<Value, QuarryError> {
        let i = id as usize;
        let v = match &self.values {
            DictValues::Int(v) => v.get(i).map(|x| Value::Int(*x)),
            DictValues::Long(v) => v.get(i).map(|x| Value::Long(*x)),
            DictValues::Float(v) => v.get(i).map(|x| Value::Float(*x)),
            DictValues::Double(v) => v.get(i).map(|x| Value::Double(*x)),
            DictValues::String(v) => v.get(i).map(|x| Value::String(x.clone())),
        };
        v.ok_or_else(|| QuarryError::out_of_range("dictionary id", id as u64, self.len() as u64))
    }

    /// Numeric value of `id` without allocating a [`Value`].
    #[inline]
    pub fn get_f64(&self, id: u32) -> Result<f64, QuarryError> {
        let i = id as usize;
        let v = match &self.values {
            DictValues::Int(v) => v.get(i).map(|x| *x as f64),
            DictValues::Long(v) => v.get(i).map(|x| *x as f64),
            DictValues::Float(v) => v.get(i).map(|x| *x as f64),
            DictValues::Double(v) => v.get(i).copied(),
            DictValues::String(_) => {
                return Err(QuarryError::UnsupportedOperation(
                    "numeric read of a string dictionary".to_string(),
                ))
            }
        };
        v.ok_or_else(|| QuarryError::out_of_range("dictionary id", id as u64, self.len() as u64))
    }

    /// Id of `value`, or `None` when the value does not occur in the column.
    ///
    /// `None` means "no row matches"; it is not an error. Values of another type are coerced
    /// to the dictionary type first, and a failed coercion also yields `None`.
    pub fn index_of(&self, value: &Value) -> Option<u32> {
        let probe = value.coerce_to(self.data_type()).ok()?;
        let found = match (&self.values, &probe) {
            (DictValues::Int(v), Value::Int(x)) => v.binary_search(x),
            (DictValues::Long(v), Value::Long(x)) => v.binary_search(x),
            (DictValues::Float(v), Value::Float(x)) => v.binary_search_by(|e| e.total_cmp(x)),
            (DictValues::Double(v), Value::Double(x)) => v.binary_search_by(|e| e.total_cmp(x)),
            (DictValues::String(v), Value::String(x)) => v.binary_search(x),
            _ => return None,
        };
        found.ok().map(|i| i as u32)
    }

    /// Binary search result for `value`: `Ok(id)` when present, otherwise `Err(i)` where `i`
    /// is the id the value would take if inserted.
    pub fn insertion_index(&self, value: &Value) -> Result<usize, usize> {
        match self.index_of(value) {
            Some(id) => Ok(id as usize),
            None => Err(self.partition_point(|id| self.cmp_id(id, value) == Ordering::Less) as usize),
        }
    }

    /// Ids whose values fall inside the given bounds, as a contiguous range (possibly empty).
    ///
    /// Numeric bounds are compared numerically, so `Double(2.5)` is a valid bound on an int
    /// column. A string bound on a numeric column (or the reverse) is an `InvalidQuery`.
    pub fn range_ids(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Result<Range<u32>, QuarryError> {
        for b in [&lower, &upper] {
            if let Bound::Included(v) | Bound::Excluded(v) = b {
                if v.data_type().is_numeric() != self.data_type().is_numeric() {
                    return Err(QuarryError::InvalidQuery(format!(
                        "range bound {} is not comparable with a {} column",
                        v,
                        self.data_type()
                    )));
                }
            }
        }
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(v) => self.partition_point(|id| self.cmp_id(id, v) == Ordering::Less),
            Bound::Excluded(v) => self.partition_point(|id| self.cmp_id(id, v) != Ordering::Greater),
        };
        let end = match upper {
            Bound::Unbounded => self.len(),
            Bound::Included(v) => self.partition_point(|id| self.cmp_id(id, v) != Ordering::Greater),
            Bound::Excluded(v) => self.partition_point(|id| self.cmp_id(id, v) == Ordering::Less),
        };
        Ok(start..end.max(start))
    }

    /// First id in `0..len` for which `pred` is false; `pred` must be monotone.
    fn partition_point(&self, pred: impl Fn(u32) -> bool) -> u32 {
        let (mut lo, mut hi) = (0u32, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(mid) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Compares the value of `id` against `probe`; caller guarantees `id < len`.
    fn cmp_id(&self, id: u32, probe: &Value) -> Ordering {
        let i = id as usize;
        match (&self.values, probe) {
            (DictValues::Int(v), Value::Int(x)) => v[i].cmp(x),
            (DictValues::Long(v), Value::Long(x)) => v[i].cmp(x),
            (DictValues::Long(v), Value::Int(x)) => v[i].cmp(&(*x as i64)),
            (DictValues::Int(v), Value::Long(x)) => (v[i] as i64).cmp(x),
            (DictValues::String(v), Value::String(x)) => v[i].as_str().cmp(x.as_str()),
            (_, p) => {
                let mine = match &self.values {
                    DictValues::Int(v) => v[i] as f64,
                    DictValues::Long(v) => v[i] as f64,
                    DictValues::Float(v) => v[i] as f64,
                    DictValues::Double(v) => v[i],
                    DictValues::String(_) => return Ordering::Less,
                };
                mine.total_cmp(&p.as_f64().unwrap_or(f64::NAN))
            }
        }
    }

    fn check_strictly_ascending(&self) -> Result<(), String> {
        fn check<T>(v: &[T], cmp: impl Fn(&T, &T) -> Ordering) -> Result<(), String> {
            match v.windows(2).position(|w| cmp(&w[0], &w[1]) != Ordering::Less) {
                Some(i) => Err(format!("Dictionary values not strictly ascending at id {}", i + 1)),
                None => Ok(()),
            }
        }
        match &self.values {
            DictValues::Int(v) => check(v, |a, b| a.cmp(b)),
            DictValues::Long(v) => check(v, |a, b| a.cmp(b)),
            DictValues::Float(v) => check(v, |a, b| a.total_cmp(b)),
            DictValues::Double(v) => check(v, |a, b| a.total_cmp(b)),
            DictValues::String(v) => check(v, |a, b| a.cmp(b)),
        }
    }

    /// Serializes the dictionary file.
    ///
    /// Layout: magic(8) + version(u32) + type tag(u8) + cardinality(u32), then numeric values as
    /// fixed-width big-endian, or for strings `cardinality + 1` u32 offsets into the trailing
    /// UTF-8 bytes. A crc32 of everything before it closes the file.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(DICT_MAGIC);
        write_u32(&mut out, DICT_VERSION);
        out.push(self.data_type().tag());
        write_u32(&mut out, self.len());
        match &self.values {
            DictValues::Int(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            DictValues::Long(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            DictValues::Float(v) => v
                .iter()
                .for_each(|x| out.extend_from_slice(&x.to_bits().to_be_bytes())),
            DictValues::Double(v) => v
                .iter()
                .for_each(|x| out.extend_from_slice(&x.to_bits().to_be_bytes())),
            DictValues::String(v) => {
                let mut offset = 0u32;
                write_u32(&mut out, 0);
                for s in v {
                    offset += s.len() as u32;
                    write_u32(&mut out, offset);
                }
                for s in v {
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        seal_with_crc(&mut out);
        out
    }

    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, QuarryError> {
        let body = verify_trailing_crc(bytes).map_err(|d| QuarryError::corrupt(d, path))?;
        let mut cur = Cursor::new(body);
        let truncated = |e: QuarryError| QuarryError::corrupt(format!("Truncated dictionary: {}", e), path);

        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic)
            .map_err(|e| truncated(QuarryError::Io(e)))?;
        if &magic != DICT_MAGIC {
            return Err(QuarryError::corrupt("Bad dictionary magic", path));
        }
        let version = read_u32(&mut cur).map_err(truncated)?;
        if version != DICT_VERSION {
            return Err(QuarryError::corrupt(
                format!("Unsupported dictionary version {}", version),
                path,
            ));
        }
        let tag = read_u8(&mut cur).map_err(truncated)?;
        let data_type = DataType::from_tag(tag)
            .ok_or_else(|| QuarryError::corrupt(format!("Unknown data type tag {}", tag), path))?;
        let card = read_u32(&mut cur).map_err(truncated)? as usize;

        let rest = &body[cur.position() as usize..];
        let fixed = |width: usize| fixed_width_values(rest, card, width, path);
        let values = match data_type {
            DataType::Int => DictValues::Int(
                fixed(4)?
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Long => DictValues::Long(
                fixed(8)?
                    .map(|c| {
                        let mut a = [0u8; 8];
                        a.copy_from_slice(c);
                        i64::from_be_bytes(a)
                    })
                    .collect(),
            ),
            DataType::Float => DictValues::Float(
                fixed(4)?
                    .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                    .collect(),
            ),
            DataType::Double => DictValues::Double(
                fixed(8)?
                    .map(|c| {
                        let mut a = [0u8; 8];
                        a.copy_from_slice(c);
                        f64::from_bits(u64::from_be_bytes(a))
                    })
                    .collect(),
            ),
            DataType::String => {
                let mut offsets = Vec::with_capacity(card + 1);
                for _ in 0..=card {
                    offsets.push(read_u32(&mut cur).map_err(truncated)? as usize);
                }
                let data = &body[cur.position() as usize..];
                if offsets.last().copied() != Some(data.len()) {
                    return Err(QuarryError::corrupt("String dictionary length mismatch", path));
                }
                let mut strings = Vec::with_capacity(card);
                for w in offsets.windows(2) {
                    let raw = data
                        .get(w[0]..w[1])
                        .ok_or_else(|| QuarryError::corrupt("String dictionary offsets out of order", path))?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|e| QuarryError::corrupt(format!("Invalid UTF-8 in dictionary: {}", e), path))?;
                    strings.push(s.to_string());
                }
                DictValues::String(strings)
            }
        };
        let dict = Dictionary { values };
        dict.check_strictly_ascending()
            .map_err(|d| QuarryError::corrupt(d, path))?;
        Ok(dict)
    }
}

fn fixed_width_values<'a>(
    rest: &'a [u8],
    card: usize,
    width: usize,
    path: &Path,
) -> Result<std::slice::ChunksExact<'a, u8>, QuarryError> {
    if rest.len() != card * width {
        return Err(QuarryError::corrupt(
            format!(
                "Dictionary payload is {} bytes, expected {} x {}",
                rest.len(),
                card,
                width
            ),
            path,
        ));
    }
    Ok(rest.chunks_exact(width))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(vals: &[&str]) -> Dictionary {
        let values: Vec<Value> = vals.iter().map(|s| Value::from(*s)).collect();
        Dictionary::from_sorted_values(DataType::String, &values).unwrap()
    }

    #[test]
    fn lookup_and_get_are_inverse() {
        let d = strings(&["apple", "kiwi", "pear"]);
        assert_eq!(d.len(), 3);
        for id in 0..3 {
            let v = d.get(id).unwrap();
            assert_eq!(d.index_of(&v), Some(id));
        }
        assert_eq!(d.index_of(&Value::from("banana")), None);
        assert!(matches!(d.get(3), Err(QuarryError::OutOfRange { .. })));
    }

    #[test]
    fn numeric_lookup_coerces_probe() {
        let values: Vec<Value> = [-5, 0, 7, 42].into_iter().map(Value::Int).collect();
        let d = Dictionary::from_sorted_values(DataType::Int, &values).unwrap();
        assert_eq!(d.index_of(&Value::Long(7)), Some(2));
        assert_eq!(d.index_of(&Value::String("42".into())), Some(3));
        assert_eq!(d.index_of(&Value::Double(7.5)), None);
        assert_eq!(d.get_f64(0).unwrap(), -5.0);
    }

    #[test]
    fn range_ids_respect_inclusivity_and_fractional_bounds() {
        let values: Vec<Value> = [10, 20, 30, 40].into_iter().map(Value::Long).collect();
        let d = Dictionary::from_sorted_values(DataType::Long, &values).unwrap();
        let v20 = Value::Long(20);
        let v40 = Value::Long(40);
        assert_eq!(d.range_ids(Bound::Included(&v20), Bound::Included(&v40)).unwrap(), 1..4);
        assert_eq!(d.range_ids(Bound::Excluded(&v20), Bound::Excluded(&v40)).unwrap(), 2..3);
        let f = Value::Double(25.5);
        assert_eq!(d.range_ids(Bound::Included(&f), Bound::Unbounded).unwrap(), 2..4);
        let lo = Value::Long(41);
        assert!(d.range_ids(Bound::Included(&lo), Bound::Unbounded).unwrap().is_empty());
        let s = Value::from("x");
        assert!(matches!(
            d.range_ids(Bound::Included(&s), Bound::Unbounded),
            Err(QuarryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let values = vec![Value::Int(3), Value::Int(1)];
        assert!(Dictionary::from_sorted_values(DataType::Int, &values).is_err());
        let dup = vec![Value::Int(1), Value::Int(1)];
        assert!(Dictionary::from_sorted_values(DataType::Int, &dup).is_err());
    }

    #[test]
    fn encoded_dictionary_decodes_and_detects_corruption() {
        let d = strings(&["", "a", "ab", "zzz"]);
        let mut bytes = d.encode();
        let back = Dictionary::decode(&bytes, Path::new("x.dict")).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back.get(2).unwrap(), Value::from("ab"));

        let doubles: Vec<Value> = [-1.5, 0.0, 3.25].into_iter().map(Value::Double).collect();
        let dd = Dictionary::from_sorted_values(DataType::Double, &doubles).unwrap();
        let back = Dictionary::decode(&dd.encode(), Path::new("d.dict")).unwrap();
        assert_eq!(back.get_f64(2).unwrap(), 3.25);

        let n = bytes.len();
        bytes[n - 6] ^= 0xFF;
        match Dictionary::decode(&bytes, Path::new("x.dict")) {
            Err(QuarryError::CorruptSegment { details, .. }) => {
                assert!(details.contains("Checksum"), "{}", details)
            }
            other => panic!("expected CorruptSegment, got {:?}", other),
        }
    }
}
