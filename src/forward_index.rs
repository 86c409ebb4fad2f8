//! Forward indexes ("row → value"): fixed-bit single-value and multi-value dictionary-id
//! indexes, and chunk-compressed raw indexes for no-dictionary metric columns.

use crate::bitpack::{bits_for_cardinality, FixedBitReader, FixedBitWriter};
use crate::buffer::DataBuffer;
use crate::encoding::{
    compress_chunk, decompress_chunk, i32_at, read_u32, read_u8, u64_at, write_i32, write_u32, write_u64,
    BlockCompression,
};
use crate::error::QuarryError;
use crate::types::{DataType, Value};

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

/// Forward index of one column, by layout.
#[derive(Debug)]
pub enum ForwardIndex {
    SingleValue(SingleValueForwardIndex),
    MultiValue(MultiValueForwardIndex),
    Raw(RawForwardIndex),
}

impl ForwardIndex {
    pub fn num_rows(&self) -> u32 {
        match self {
            ForwardIndex::SingleValue(f) => f.num_rows(),
            ForwardIndex::MultiValue(f) => f.num_rows(),
            ForwardIndex::Raw(f) => f.num_docs(),
        }
    }
}

// --- single value ---

/// Dictionary ids of a single-value column, one fixed-width slot per row.
#[derive(Debug, Clone)]
pub struct SingleValueForwardIndex {
    reader: FixedBitReader,
    bits: u8,
}

impl SingleValueForwardIndex {
    pub fn new(buffer: DataBuffer, num_rows: u32, bits: u8) -> Result<Self, QuarryError> {
        Ok(Self {
            reader: FixedBitReader::single_column(buffer, num_rows, bits)?,
            bits,
        })
    }

    pub fn num_rows(&self) -> u32 {
        self.reader.rows()
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    pub fn get(&self, row: u32) -> Result<u32, QuarryError> {
        self.reader.get(row, 0)
    }

    /// Bulk read of consecutive rows starting at `start_row`.
    pub fn read_range(&self, start_row: u32, out: &mut [u32]) -> Result<(), QuarryError> {
        self.reader.get_range(start_row, 0, out)
    }

    /// Appends the ids of `docs` (any order) to `out`.
    pub fn read_dict_ids(&self, docs: &[u32], out: &mut Vec<u32>) -> Result<(), QuarryError> {
        out.reserve(docs.len());
        for &doc in docs {
            out.push(self.reader.get(doc, 0)?);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SingleValueForwardIndexCreator {
    writer: FixedBitWriter,
}

impl SingleValueForwardIndexCreator {
    pub fn new(num_rows: u32, cardinality: u32) -> Result<Self, QuarryError> {
        Ok(Self {
            writer: FixedBitWriter::single_column(num_rows, bits_for_cardinality(cardinality))?,
        })
    }

    pub fn index(&mut self, row: u32, dict_id: u32) -> Result<(), QuarryError> {
        self.writer.set(row, 0, dict_id)
    }

    pub fn seal(self) -> Vec<u8> {
        self.writer.into_bytes()
    }
}

// --- multi value ---

const MV_HEADER_ENTRY_BYTES: usize = 8;
const MV_INT_ONLY: &str = "Only int data types are allowed in multivalue fixed bit format";

/// Dictionary ids of a multi-value column.
///
/// Layout: `num_rows` header entries of `(i32 start, i32 length)` (big-endian) followed by
/// all ids bit-packed at one width. `total_values = start[last] + length[last]`.
#[derive(Debug, Clone)]
pub struct MultiValueForwardIndex {
    header: DataBuffer,
    data: FixedBitReader,
    num_rows: u32,
    total_values: u32,
    bits: u8,
}

impl MultiValueForwardIndex {
    pub fn new(buffer: DataBuffer, num_rows: u32, bits: u8) -> Result<Self, QuarryError> {
        let header_len = num_rows as usize * MV_HEADER_ENTRY_BYTES;
        if buffer.len() < header_len {
            return Err(QuarryError::CorruptSegment {
                details: format!(
                    "Multi-value header needs {} bytes, region has {}",
                    header_len,
                    buffer.len()
                ),
                path: None,
            });
        }
        let header = buffer.slice(0..header_len)?;

        let mut total_values = 0u32;
        let mut expected_start = 0i64;
        for row in 0..num_rows as usize {
            let at = row * MV_HEADER_ENTRY_BYTES;
            let start = i32_at(&header, at).unwrap_or(-1) as i64;
            let len = i32_at(&header, at + 4).unwrap_or(-1) as i64;
            if start != expected_start || len < 0 {
                return Err(QuarryError::CorruptSegment {
                    details: format!(
                        "Multi-value header entry {} is ({}, {}), expected start {}",
                        row, start, len, expected_start
                    ),
                    path: None,
                });
            }
            expected_start = start + len;
            total_values = u32::try_from(expected_start).map_err(|_| QuarryError::CorruptSegment {
                details: "Multi-value entry count overflows".to_string(),
                path: None,
            })?;
        }

        let data = FixedBitReader::single_column(buffer.slice(header_len..buffer.len())?, total_values, bits)?;
        Ok(Self {
            header,
            data,
            num_rows,
            total_values,
            bits,
        })
    }

    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    pub fn total_values(&self) -> u32 {
        self.total_values
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    fn entry(&self, row: u32) -> Result<(u32, usize), QuarryError> {
        if row >= self.num_rows {
            return Err(QuarryError::out_of_range("row", row as u64, self.num_rows as u64));
        }
        let at = row as usize * MV_HEADER_ENTRY_BYTES;
        // Entries were validated at open.
        let start = i32_at(&self.header, at).unwrap_or(0) as u32;
        let len = i32_at(&self.header, at + 4).unwrap_or(0) as usize;
        Ok((start, len))
    }

    pub fn num_values(&self, row: u32) -> Result<usize, QuarryError> {
        Ok(self.entry(row)?.1)
    }

    /// Copies the ids of `row` into the front of `out` and returns how many were written.
    pub fn get_int_array(&self, row: u32, out: &mut [u32]) -> Result<usize, QuarryError> {
        let (start, len) = self.entry(row)?;
        if len > out.len() {
            return Err(QuarryError::out_of_range(
                "multi-value buffer",
                len as u64,
                out.len() as u64,
            ));
        }
        self.data.get_range(start, 0, &mut out[..len])?;
        Ok(len)
    }

    /// Replaces the contents of `out` with the ids of `row`.
    pub fn read_into(&self, row: u32, out: &mut Vec<u32>) -> Result<usize, QuarryError> {
        let (start, len) = self.entry(row)?;
        out.clear();
        out.resize(len, 0);
        self.data.get_range(start, 0, out)?;
        Ok(len)
    }

    pub fn get_long_array(&self, _row: u32, _out: &mut [i64]) -> Result<usize, QuarryError> {
        Err(QuarryError::UnsupportedOperation(MV_INT_ONLY.to_string()))
    }

    pub fn get_float_array(&self, _row: u32, _out: &mut [f32]) -> Result<usize, QuarryError> {
        Err(QuarryError::UnsupportedOperation(MV_INT_ONLY.to_string()))
    }

    pub fn get_double_array(&self, _row: u32, _out: &mut [f64]) -> Result<usize, QuarryError> {
        Err(QuarryError::UnsupportedOperation(MV_INT_ONLY.to_string()))
    }

    pub fn get_string_array(&self, _row: u32, _out: &mut [String]) -> Result<usize, QuarryError> {
        Err(QuarryError::UnsupportedOperation(MV_INT_ONLY.to_string()))
    }
}

/// Accumulates multi-value rows in order and writes the header + packed data layout.
#[derive(Debug)]
pub struct MultiValueForwardIndexCreator {
    num_rows: u32,
    bits: u8,
    header: Vec<(u32, u32)>,
    values: Vec<u32>,
}

impl MultiValueForwardIndexCreator {
    pub fn new(num_rows: u32, total_values_hint: usize, cardinality: u32) -> Self {
        Self {
            num_rows,
            bits: bits_for_cardinality(cardinality),
            header: Vec::with_capacity(num_rows as usize),
            values: Vec::with_capacity(total_values_hint),
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Rows must be indexed in order `0, 1, 2, ..`.
    pub fn index(&mut self, row: u32, dict_ids: &[u32]) -> Result<(), QuarryError> {
        if row as usize != self.header.len() {
            return Err(QuarryError::Internal(format!(
                "Multi-value rows must be indexed in order: got row {}, expected {}",
                row,
                self.header.len()
            )));
        }
        if row >= self.num_rows {
            return Err(QuarryError::out_of_range("row", row as u64, self.num_rows as u64));
        }
        self.header.push((self.values.len() as u32, dict_ids.len() as u32));
        self.values.extend_from_slice(dict_ids);
        Ok(())
    }

    pub fn seal(self) -> Result<Vec<u8>, QuarryError> {
        if self.header.len() != self.num_rows as usize {
            return Err(QuarryError::Internal(format!(
                "Multi-value index got {} rows, expected {}",
                self.header.len(),
                self.num_rows
            )));
        }
        let total = u32::try_from(self.values.len())
            .map_err(|_| QuarryError::Internal("Too many multi-value entries".to_string()))?;
        let mut out = Vec::with_capacity(self.header.len() * MV_HEADER_ENTRY_BYTES);
        for (start, len) in &self.header {
            write_i32(&mut out, *start as i32);
            write_i32(&mut out, *len as i32);
        }
        let mut writer = FixedBitWriter::single_column(total, self.bits)?;
        for (i, id) in self.values.iter().enumerate() {
            writer.set(i as u32, 0, *id)?;
        }
        out.extend_from_slice(writer.as_bytes());
        Ok(out)
    }
}

// --- raw (no dictionary) ---

/// Raw forward index magic bytes.
pub const RAW_MAGIC: &[u8; 8] = b"QRYRAWF1";
const RAW_VERSION: u32 = 1;

/// Fixed-width big-endian values in independently compressed chunks of `docs_per_chunk` rows.
///
/// Layout: magic(8) + version(u32) + type tag(u8) + codec(u8) + docs_per_chunk(u32) +
/// num_docs(u32) + num_chunks(u32) + `(num_chunks + 1)` u64 chunk offsets relative to the
/// start of the chunk data, then the chunks.
#[derive(Debug, Clone)]
pub struct RawForwardIndex {
    data: DataBuffer,
    offsets: Vec<u64>,
    data_type: DataType,
    width: usize,
    codec: u8,
    docs_per_chunk: u32,
    num_docs: u32,
    path: PathBuf,
}

impl RawForwardIndex {
    pub fn open(buffer: DataBuffer, path: &Path) -> Result<Self, QuarryError> {
        let truncated = |e: QuarryError| QuarryError::corrupt(format!("Truncated raw forward index: {}", e), path);
        let mut cur = Cursor::new(buffer.as_slice());
        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic).map_err(|e| truncated(e.into()))?;
        if &magic != RAW_MAGIC {
            return Err(QuarryError::corrupt("Bad raw forward index magic", path));
        }
        let version = read_u32(&mut cur).map_err(truncated)?;
        if version != RAW_VERSION {
            return Err(QuarryError::corrupt(
                format!("Unsupported raw forward index version {}", version),
                path,
            ));
        }
        let tag = read_u8(&mut cur).map_err(truncated)?;
        let data_type = DataType::from_tag(tag)
            .ok_or_else(|| QuarryError::corrupt(format!("Unknown data type tag {}", tag), path))?;
        let width = data_type
            .fixed_width()
            .ok_or_else(|| QuarryError::corrupt("Raw forward index for a non-numeric column", path))?;
        let codec = read_u8(&mut cur).map_err(truncated)?;
        let docs_per_chunk = read_u32(&mut cur).map_err(truncated)?;
        let num_docs = read_u32(&mut cur).map_err(truncated)?;
        let num_chunks = read_u32(&mut cur).map_err(truncated)? as usize;
        if docs_per_chunk == 0 || (num_docs as u64).div_ceil(docs_per_chunk as u64) != num_chunks as u64 {
            return Err(QuarryError::corrupt(
                format!(
                    "Raw forward index has {} chunks for {} docs at {} per chunk",
                    num_chunks, num_docs, docs_per_chunk
                ),
                path,
            ));
        }
        let table_at = cur.position() as usize;
        let mut offsets = Vec::with_capacity(num_chunks + 1);
        for i in 0..=num_chunks {
            let off = u64_at(&buffer, table_at + i * 8)
                .ok_or_else(|| QuarryError::corrupt("Truncated raw chunk offset table", path))?;
            offsets.push(off);
        }
        let data_at = table_at + (num_chunks + 1) * 8;
        let data = buffer.slice(data_at..buffer.len())?;
        let ordered = offsets.windows(2).all(|w| w[0] <= w[1]);
        if offsets.first() != Some(&0) || !ordered || offsets.last() != Some(&(data.len() as u64)) {
            return Err(QuarryError::corrupt("Raw chunk offsets are inconsistent", path));
        }
        Ok(Self {
            data,
            offsets,
            data_type,
            width,
            codec,
            docs_per_chunk,
            num_docs,
            path: path.to_path_buf(),
        })
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    fn chunk(&self, chunk_id: usize) -> Result<Cow<'_, [u8]>, QuarryError> {
        let start = self.offsets[chunk_id] as usize;
        let end = self.offsets[chunk_id + 1] as usize;
        let first_doc = chunk_id as u64 * self.docs_per_chunk as u64;
        let docs = (self.num_docs as u64 - first_doc).min(self.docs_per_chunk as u64) as usize;
        let raw_len = docs * self.width;
        let bytes = &self.data[start..end];
        if self.codec == crate::encoding::COMPRESS_NONE {
            if bytes.len() != raw_len {
                return Err(QuarryError::corrupt("Raw chunk has the wrong length", &self.path));
            }
            return Ok(Cow::Borrowed(bytes));
        }
        decompress_chunk(self.codec, bytes, raw_len)
            .map(Cow::Owned)
            .map_err(|d| QuarryError::corrupt(d, &self.path))
    }

    fn decode(&self, bytes: &[u8], index: usize) -> Value {
        let b = &bytes[index * self.width..(index + 1) * self.width];
        match self.data_type {
            DataType::Int => Value::Int(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            DataType::Float => Value::Float(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))),
            DataType::Long | DataType::Double => {
                let mut a = [0u8; 8];
                a.copy_from_slice(b);
                if self.data_type == DataType::Long {
                    Value::Long(i64::from_be_bytes(a))
                } else {
                    Value::Double(f64::from_bits(u64::from_be_bytes(a)))
                }
            }
            // Rejected at open.
            DataType::String => Value::String(String::new()),
        }
    }

    /// Visits `docs` in order, decompressing each chunk once per run of docs inside it.
    fn for_each(&self, docs: &[u32], mut f: impl FnMut(Value)) -> Result<(), QuarryError> {
        let mut current: Option<(usize, Cow<'_, [u8]>)> = None;
        for &doc in docs {
            if doc >= self.num_docs {
                return Err(QuarryError::out_of_range("row", doc as u64, self.num_docs as u64));
            }
            let chunk_id = (doc / self.docs_per_chunk) as usize;
            if current.as_ref().map(|(id, _)| *id) != Some(chunk_id) {
                current = Some((chunk_id, self.chunk(chunk_id)?));
            }
            if let Some((_, bytes)) = &current {
                f(self.decode(bytes, (doc % self.docs_per_chunk) as usize));
            }
        }
        Ok(())
    }

    pub fn get_value(&self, row: u32) -> Result<Value, QuarryError> {
        let mut out = None;
        self.for_each(&[row], |v| out = Some(v))?;
        out.ok_or_else(|| QuarryError::Internal("raw read produced no value".to_string()))
    }

    pub fn read_values(&self, docs: &[u32], out: &mut Vec<Value>) -> Result<(), QuarryError> {
        out.reserve(docs.len());
        self.for_each(docs, |v| out.push(v))
    }

    pub fn read_doubles(&self, docs: &[u32], out: &mut Vec<f64>) -> Result<(), QuarryError> {
        out.reserve(docs.len());
        self.for_each(docs, |v| out.push(v.as_f64().unwrap_or(f64::NAN)))
    }
}

#[derive(Debug)]
pub struct RawForwardIndexCreator {
    data_type: DataType,
    compression: BlockCompression,
    docs_per_chunk: u32,
    num_docs: u32,
    rows_written: u32,
    pending: Vec<u8>,
    chunks: Vec<u8>,
    offsets: Vec<u64>,
}

impl RawForwardIndexCreator {
    pub fn new(
        data_type: DataType,
        num_docs: u32,
        docs_per_chunk: u32,
        compression: BlockCompression,
    ) -> Result<Self, QuarryError> {
        let Some(width) = data_type.fixed_width() else {
            return Err(QuarryError::UnsupportedOperation(format!(
                "raw forward index needs a fixed-width type, got {}",
                data_type
            )));
        };
        if docs_per_chunk == 0 {
            return Err(QuarryError::ConfigError("docs_per_chunk must be positive".to_string()));
        }
        Ok(Self {
            data_type,
            compression,
            docs_per_chunk,
            num_docs,
            rows_written: 0,
            pending: Vec::with_capacity(docs_per_chunk as usize * width),
            chunks: Vec::new(),
            offsets: vec![0],
        })
    }

    /// Rows must be indexed in order; `value` must already have the column's type.
    pub fn index(&mut self, row: u32, value: &Value) -> Result<(), QuarryError> {
        if row != self.rows_written || row >= self.num_docs {
            return Err(QuarryError::Internal(format!(
                "Raw rows must be indexed in order: got row {}, expected {} of {}",
                row, self.rows_written, self.num_docs
            )));
        }
        match (self.data_type, value) {
            (DataType::Int, Value::Int(v)) => self.pending.extend_from_slice(&v.to_be_bytes()),
            (DataType::Long, Value::Long(v)) => self.pending.extend_from_slice(&v.to_be_bytes()),
            (DataType::Float, Value::Float(v)) => self.pending.extend_from_slice(&v.to_bits().to_be_bytes()),
            (DataType::Double, Value::Double(v)) => self.pending.extend_from_slice(&v.to_bits().to_be_bytes()),
            (dt, v) => {
                return Err(QuarryError::Internal(format!(
                    "Raw {} column given a {} value",
                    dt,
                    v.data_type()
                )))
            }
        }
        self.rows_written += 1;
        if self.rows_written % self.docs_per_chunk == 0 {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<(), QuarryError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let packed = compress_chunk(self.compression, &self.pending)?;
        self.chunks.extend_from_slice(&packed);
        self.offsets.push(self.chunks.len() as u64);
        self.pending.clear();
        Ok(())
    }

    pub fn seal(mut self) -> Result<Vec<u8>, QuarryError> {
        if self.rows_written != self.num_docs {
            return Err(QuarryError::Internal(format!(
                "Raw forward index got {} rows, expected {}",
                self.rows_written, self.num_docs
            )));
        }
        self.flush_chunk()?;
        let num_chunks = self.offsets.len() - 1;
        let mut out = Vec::with_capacity(32 + self.offsets.len() * 8 + self.chunks.len());
        out.extend_from_slice(RAW_MAGIC);
        write_u32(&mut out, RAW_VERSION);
        out.push(self.data_type.tag());
        out.push(self.compression.codec());
        write_u32(&mut out, self.docs_per_chunk);
        write_u32(&mut out, self.num_docs);
        write_u32(&mut out, num_chunks as u32);
        for off in &self.offsets {
            write_u64(&mut out, *off);
        }
        out.extend_from_slice(&self.chunks);
        Ok(out)
    }
}
