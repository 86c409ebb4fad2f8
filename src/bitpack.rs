//! Fixed-bit-width integer packing over a row/column grid.
//!
//! Row `r`, column `c` occupies bits `[r * row_bits + col_offset(c), .. + width(c))` of a flat
//! byte region, most significant bit first within each byte. A single-column grid of width `w`
//! is the single-value forward index layout: row `r` at bits `[r*w, r*w + w)`.
//!
//! Signed columns store `value + (2^bits - 1)` in `bits + 1` physical bits, so a signed column
//! of `bits` accepts values in `[-(2^bits - 1), 2^bits]`.

use crate::buffer::DataBuffer;
use crate::error::QuarryError;

/// Widest physical column, in bits.
pub const MAX_PHYSICAL_BITS: u32 = 32;

/// Width and signedness of one packed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnBits {
    bits: u8,
    signed: bool,
}

impl ColumnBits {
    pub fn unsigned(bits: u8) -> Result<Self, QuarryError> {
        Self::new(bits, false)
    }

    pub fn signed(bits: u8) -> Result<Self, QuarryError> {
        Self::new(bits, true)
    }

    fn new(bits: u8, signed: bool) -> Result<Self, QuarryError> {
        let c = ColumnBits { bits, signed };
        if bits == 0 || c.physical_bits() > MAX_PHYSICAL_BITS {
            return Err(QuarryError::out_of_range(
                "column bit width",
                c.physical_bits() as u64,
                MAX_PHYSICAL_BITS as u64,
            ));
        }
        Ok(c)
    }

    pub fn bits(self) -> u8 {
        self.bits
    }

    pub fn is_signed(self) -> bool {
        self.signed
    }

    /// Bits actually occupied in the packed row.
    pub fn physical_bits(self) -> u32 {
        self.bits as u32 + self.signed as u32
    }

    fn offset(self) -> i64 {
        if self.signed {
            (1i64 << self.bits) - 1
        } else {
            0
        }
    }

    fn max_raw(self) -> u64 {
        (1u64 << self.physical_bits()) - 1
    }
}

/// Minimum bits to store dictionary ids `0..cardinality`: `ceil(log2(cardinality))`, at least 1.
pub fn bits_for_cardinality(cardinality: u32) -> u8 {
    if cardinality <= 2 {
        1
    } else {
        (32 - (cardinality - 1).leading_zeros()) as u8
    }
}

/// Minimum bits to store the value `max_value` (at least 1).
pub fn bits_for_max_value(max_value: u32) -> u8 {
    if max_value == 0 {
        1
    } else {
        (32 - max_value.leading_zeros()) as u8
    }
}

#[derive(Debug, Clone)]
struct RowLayout {
    columns: Vec<ColumnBits>,
    col_offsets: Vec<u64>,
    row_bits: u64,
}

impl RowLayout {
    fn new(columns: &[ColumnBits]) -> Result<Self, QuarryError> {
        if columns.is_empty() {
            return Err(QuarryError::Internal(
                "Fixed-bit layout needs at least one column".to_string(),
            ));
        }
        let mut col_offsets = Vec::with_capacity(columns.len());
        let mut row_bits = 0u64;
        for c in columns {
            col_offsets.push(row_bits);
            row_bits += c.physical_bits() as u64;
        }
        Ok(Self {
            columns: columns.to_vec(),
            col_offsets,
            row_bits,
        })
    }

    fn total_bytes(&self, rows: u32) -> usize {
        ((rows as u64 * self.row_bits + 7) / 8) as usize
    }

    #[inline]
    fn bit_offset(&self, row: u32, col: usize, rows: u32) -> Result<(u64, ColumnBits), QuarryError> {
        if row >= rows {
            return Err(QuarryError::out_of_range("row", row as u64, rows as u64));
        }
        let Some(&bits) = self.columns.get(col) else {
            return Err(QuarryError::out_of_range(
                "column",
                col as u64,
                self.columns.len() as u64,
            ));
        };
        Ok((row as u64 * self.row_bits + self.col_offsets[col], bits))
    }
}

/// Extracts `width` bits starting at `bit_offset`, reading only the bytes the span straddles.
#[inline]
pub(crate) fn read_bits(bytes: &[u8], bit_offset: u64, width: u32) -> u32 {
    let start_byte = (bit_offset >> 3) as usize;
    let end_byte = ((bit_offset + width as u64 - 1) >> 3) as usize;
    let mut acc = 0u64;
    for &b in &bytes[start_byte..=end_byte] {
        acc = (acc << 8) | b as u64;
    }
    let span_bits = ((end_byte - start_byte + 1) * 8) as u64;
    let shift = span_bits - (bit_offset & 7) - width as u64;
    ((acc >> shift) & ((1u64 << width) - 1)) as u32
}

#[inline]
pub(crate) fn write_bits(bytes: &mut [u8], bit_offset: u64, width: u32, value: u32) {
    let start_byte = (bit_offset >> 3) as usize;
    let end_byte = ((bit_offset + width as u64 - 1) >> 3) as usize;
    let mut acc = 0u64;
    for &b in &bytes[start_byte..=end_byte] {
        acc = (acc << 8) | b as u64;
    }
    let span_bits = ((end_byte - start_byte + 1) * 8) as u64;
    let shift = span_bits - (bit_offset & 7) - width as u64;
    let mask = ((1u64 << width) - 1) << shift;
    acc = (acc & !mask) | (((value as u64) << shift) & mask);
    for i in (start_byte..=end_byte).rev() {
        bytes[i] = acc as u8;
        acc >>= 8;
    }
}

/// In-memory writer for a packed row/column grid.
#[derive(Debug, Clone)]
pub struct FixedBitWriter {
    layout: RowLayout,
    rows: u32,
    bytes: Vec<u8>,
}

impl FixedBitWriter {
    /// Allocates `ceil(rows * row_bits / 8)` zeroed bytes.
    pub fn new(rows: u32, columns: &[ColumnBits]) -> Result<Self, QuarryError> {
        let layout = RowLayout::new(columns)?;
        let bytes = vec![0u8; layout.total_bytes(rows)];
        Ok(Self {
            layout,
            rows,
            bytes,
        })
    }

    /// Single unsigned column of width `bits`.
    pub fn single_column(rows: u32, bits: u8) -> Result<Self, QuarryError> {
        Self::new(rows, &[ColumnBits::unsigned(bits)?])
    }

    /// Writes the raw (already offset) value of `(row, col)`.
    pub fn set(&mut self, row: u32, col: usize, value: u32) -> Result<(), QuarryError> {
        let (offset, bits) = self.layout.bit_offset(row, col, self.rows)?;
        if value as u64 > bits.max_raw() {
            return Err(QuarryError::out_of_range(
                "packed value",
                value as u64,
                bits.max_raw() + 1,
            ));
        }
        write_bits(&mut self.bytes, offset, bits.physical_bits(), value);
        Ok(())
    }

    /// Writes a logical value, applying the signed offset for signed columns.
    pub fn set_int(&mut self, row: u32, col: usize, value: i32) -> Result<(), QuarryError> {
        let bits = *self
            .layout
            .columns
            .get(col)
            .ok_or_else(|| QuarryError::out_of_range("column", col as u64, self.layout.columns.len() as u64))?;
        let raw = value as i64 + bits.offset();
        if raw < 0 || raw as u64 > bits.max_raw() {
            return Err(QuarryError::UnsupportedOperation(format!(
                "value {} does not fit a {}-bit {} column",
                value,
                bits.bits(),
                if bits.is_signed() { "signed" } else { "unsigned" }
            )));
        }
        self.set(row, col, raw as u32)
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Random-access reader over a packed row/column grid held in a [`DataBuffer`].
///
/// Every access is O(1): the bit offset is computed, never scanned for.
#[derive(Debug, Clone)]
pub struct FixedBitReader {
    layout: RowLayout,
    rows: u32,
    buffer: DataBuffer,
}

impl FixedBitReader {
    pub fn new(buffer: DataBuffer, rows: u32, columns: &[ColumnBits]) -> Result<Self, QuarryError> {
        let layout = RowLayout::new(columns)?;
        let needed = layout.total_bytes(rows);
        if buffer.len() < needed {
            return Err(QuarryError::CorruptSegment {
                details: format!(
                    "Fixed-bit region holds {} bytes, {} rows x {} bits need {}",
                    buffer.len(),
                    rows,
                    layout.row_bits,
                    needed
                ),
                path: None,
            });
        }
        Ok(Self {
            layout,
            rows,
            buffer,
        })
    }

    pub fn single_column(buffer: DataBuffer, rows: u32, bits: u8) -> Result<Self, QuarryError> {
        Self::new(buffer, rows, &[ColumnBits::unsigned(bits)?])
    }

    /// Raw stored value of `(row, col)`.
    #[inline]
    pub fn get(&self, row: u32, col: usize) -> Result<u32, QuarryError> {
        let (offset, bits) = self.layout.bit_offset(row, col, self.rows)?;
        Ok(read_bits(&self.buffer, offset, bits.physical_bits()))
    }

    /// Logical value of `(row, col)`, removing the signed offset for signed columns.
    pub fn get_int(&self, row: u32, col: usize) -> Result<i32, QuarryError> {
        let (offset, bits) = self.layout.bit_offset(row, col, self.rows)?;
        let raw = read_bits(&self.buffer, offset, bits.physical_bits()) as i64;
        Ok((raw - bits.offset()) as i32)
    }

    /// Bulk read of `out.len()` consecutive rows of `col`, starting at `start_row`.
    pub fn get_range(&self, start_row: u32, col: usize, out: &mut [u32]) -> Result<(), QuarryError> {
        if out.is_empty() {
            return Ok(());
        }
        let last = start_row as u64 + out.len() as u64 - 1;
        if last >= self.rows as u64 {
            return Err(QuarryError::out_of_range("row", last, self.rows as u64));
        }
        let (mut offset, bits) = self.layout.bit_offset(start_row, col, self.rows)?;
        let width = bits.physical_bits();
        let bytes = self.buffer.as_slice();
        for slot in out.iter_mut() {
            *slot = read_bits(bytes, offset, width);
            offset += self.layout.row_bits;
        }
        Ok(())
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.layout.columns.len()
    }

    pub fn column_bits(&self, col: usize) -> Option<ColumnBits> {
        self.layout.columns.get(col).copied()
    }

    pub fn buffer(&self) -> &DataBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_column_packs_msb_first() {
        let mut w = FixedBitWriter::single_column(3, 3).unwrap();
        for (row, v) in [5u32, 3, 7].into_iter().enumerate() {
            w.set(row as u32, 0, v).unwrap();
        }
        // 101 011 111 -> 1010_1111 1000_0000
        assert_eq!(w.as_bytes(), &[0xAF, 0x80]);

        let r = FixedBitReader::single_column(DataBuffer::from_vec(w.into_bytes()), 3, 3).unwrap();
        assert_eq!(r.get(0, 0).unwrap(), 5);
        assert_eq!(r.get(1, 0).unwrap(), 3);
        assert_eq!(r.get(2, 0).unwrap(), 7);
    }

    #[test]
    fn bits_for_cardinality_is_ceil_log2_with_floor_of_one() {
        assert_eq!(bits_for_cardinality(0), 1);
        assert_eq!(bits_for_cardinality(1), 1);
        assert_eq!(bits_for_cardinality(2), 1);
        assert_eq!(bits_for_cardinality(3), 2);
        assert_eq!(bits_for_cardinality(4), 2);
        assert_eq!(bits_for_cardinality(5), 3);
        assert_eq!(bits_for_cardinality(1024), 10);
        assert_eq!(bits_for_cardinality(1025), 11);
        assert_eq!(bits_for_max_value(0), 1);
        assert_eq!(bits_for_max_value(7), 3);
        assert_eq!(bits_for_max_value(8), 4);
    }

    #[test]
    fn multi_column_rows_with_signed_column() {
        let cols = [
            ColumnBits::unsigned(3).unwrap(),
            ColumnBits::unsigned(13).unwrap(),
            ColumnBits::signed(4).unwrap(),
        ];
        let rows = 50u32;
        let mut w = FixedBitWriter::new(rows, &cols).unwrap();
        let expected: Vec<(u32, u32, i32)> = (0..rows)
            .map(|r| (r % 8, (r * 977) % 8192, (r as i32 % 31) - 15))
            .collect();
        for (r, (a, b, c)) in expected.iter().enumerate() {
            w.set(r as u32, 0, *a).unwrap();
            w.set(r as u32, 1, *b).unwrap();
            w.set_int(r as u32, 2, *c).unwrap();
        }
        // 3 + 13 + (4 + 1) = 21 bits per row.
        assert_eq!(w.as_bytes().len(), (50 * 21 + 7) / 8);

        let r = FixedBitReader::new(DataBuffer::from_vec(w.into_bytes()), rows, &cols).unwrap();
        for (row, (a, b, c)) in expected.iter().enumerate() {
            let row = row as u32;
            assert_eq!(r.get(row, 0).unwrap(), *a);
            assert_eq!(r.get(row, 1).unwrap(), *b);
            assert_eq!(r.get_int(row, 2).unwrap(), *c);
        }
        let mut bulk = vec![0u32; 10];
        r.get_range(20, 1, &mut bulk).unwrap();
        let want: Vec<u32> = expected[20..30].iter().map(|e| e.1).collect();
        assert_eq!(bulk, want);
    }

    #[test]
    fn signed_column_bounds() {
        let cols = [ColumnBits::signed(3).unwrap()];
        let mut w = FixedBitWriter::new(2, &cols).unwrap();
        w.set_int(0, 0, -7).unwrap();
        w.set_int(1, 0, 8).unwrap();
        assert!(w.set_int(0, 0, -8).is_err());
        assert!(w.set_int(0, 0, 9).is_err());
        let r = FixedBitReader::new(DataBuffer::from_vec(w.into_bytes()), 2, &cols).unwrap();
        assert_eq!(r.get(0, 0).unwrap(), 0);
        assert_eq!(r.get_int(0, 0).unwrap(), -7);
        assert_eq!(r.get_int(1, 0).unwrap(), 8);
    }

    #[test]
    fn out_of_range_access_is_reported() {
        let mut w = FixedBitWriter::single_column(4, 2).unwrap();
        assert!(matches!(w.set(4, 0, 1), Err(QuarryError::OutOfRange { .. })));
        assert!(matches!(w.set(0, 1, 1), Err(QuarryError::OutOfRange { .. })));
        assert!(matches!(w.set(0, 0, 4), Err(QuarryError::OutOfRange { .. })));
        let r = FixedBitReader::single_column(DataBuffer::from_vec(w.into_bytes()), 4, 2).unwrap();
        assert!(matches!(r.get(4, 0), Err(QuarryError::OutOfRange { .. })));
        let mut out = [0u32; 3];
        assert!(matches!(r.get_range(2, 0, &mut out), Err(QuarryError::OutOfRange { .. })));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = FixedBitReader::single_column(DataBuffer::from_vec(vec![0u8; 3]), 10, 3).unwrap_err();
        assert!(matches!(err, QuarryError::CorruptSegment { .. }));
    }
}
