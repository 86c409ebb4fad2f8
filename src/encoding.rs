//! Byte-level helpers shared by the segment file formats: big-endian primitives, crc32 and
//! chunk compression (none / LZ4 / Zstd).

use crate::error::QuarryError;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Per-chunk compression for raw forward indexes.
/// Serde: internally tagged table `type` + `level` for zstd (e.g. `type = "zstd", level = 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockCompression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Default for BlockCompression {
    fn default() -> Self {
        BlockCompression::Lz4
    }
}

pub(crate) const COMPRESS_NONE: u8 = 0;
pub(crate) const COMPRESS_LZ4: u8 = 1;
pub(crate) const COMPRESS_ZSTD: u8 = 2;

impl BlockCompression {
    pub(crate) fn codec(self) -> u8 {
        match self {
            BlockCompression::None => COMPRESS_NONE,
            BlockCompression::Lz4 => COMPRESS_LZ4,
            BlockCompression::Zstd { .. } => COMPRESS_ZSTD,
        }
    }

    /// Codec name recorded in column metadata.
    pub fn name(self) -> &'static str {
        match self {
            BlockCompression::None => "none",
            BlockCompression::Lz4 => "lz4",
            BlockCompression::Zstd { .. } => "zstd",
        }
    }
}

pub(crate) fn compress_chunk(compression: BlockCompression, payload: &[u8]) -> Result<Vec<u8>, QuarryError> {
    match compression {
        BlockCompression::None => Ok(payload.to_vec()),
        BlockCompression::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
        BlockCompression::Zstd { level } => zstd::bulk::compress(payload, level)
            .map_err(|e| QuarryError::Internal(format!("Zstd compress failed: {}", e))),
    }
}

/// Inverse of [`compress_chunk`]; `raw_len` is the exact decompressed size.
pub(crate) fn decompress_chunk(codec: u8, bytes: &[u8], raw_len: usize) -> Result<Vec<u8>, String> {
    let raw = match codec {
        COMPRESS_NONE => bytes.to_vec(),
        COMPRESS_LZ4 => lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| format!("LZ4 decompress failed: {}", e))?,
        COMPRESS_ZSTD => zstd::bulk::decompress(bytes, raw_len)
            .map_err(|e| format!("Zstd decompress failed: {}", e))?,
        other => return Err(format!("Unknown chunk codec {}", other)),
    };
    if raw.len() != raw_len {
        return Err(format!(
            "Chunk decompressed to {} bytes, expected {}",
            raw.len(),
            raw_len
        ));
    }
    Ok(raw)
}

// All multi-byte integers in segment files are big-endian.

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, QuarryError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, QuarryError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, QuarryError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}
pub fn read_i64<R: Read>(r: &mut R) -> Result<i64, QuarryError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

/// Reads a big-endian `i32` at `offset` of a byte slice, or `None` when it does not fit.
#[inline]
pub(crate) fn i32_at(bytes: &[u8], offset: usize) -> Option<i32> {
    let b = bytes.get(offset..offset.checked_add(4)?)?;
    Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let b = bytes.get(offset..offset.checked_add(8)?)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Some(u64::from_be_bytes(a))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

/// Appends a crc32 of everything written so far.
pub(crate) fn seal_with_crc(buf: &mut Vec<u8>) {
    let crc = crc32(buf);
    write_u32(buf, crc);
}

/// Splits off and verifies a trailing crc32 produced by [`seal_with_crc`].
pub(crate) fn verify_trailing_crc(bytes: &[u8]) -> Result<&[u8], String> {
    if bytes.len() < 4 {
        return Err("Truncated: missing trailing checksum".to_string());
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32(body);
    if stored != actual {
        return Err(format!(
            "Checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored, actual
        ));
    }
    Ok(body)
}
