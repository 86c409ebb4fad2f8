//! Segment and column metadata, the segment file naming scheme, and the integrity files.

use crate::encoding::{read_i64, read_u32, read_u64, write_i64};
use crate::error::QuarryError;
use crate::types::{DataType, FieldType, Value};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const METADATA_FILE: &str = "metadata.bin";
pub const CREATION_META_FILE: &str = "creation.meta";

const METADATA_MAGIC: &[u8; 8] = b"QRYMETA1";
const METADATA_VERSION: u32 = 1;

/// Version of the segment directory layout written by this crate.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Per-column facts recorded at seal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: DataType,
    pub field_type: FieldType,
    /// Distinct values; 0 for raw (no-dictionary) columns.
    pub cardinality: u32,
    pub total_docs: u32,
    pub total_number_of_entries: u64,
    pub bits_per_element: u8,
    pub max_number_of_multi_values: u32,
    pub single_value: bool,
    /// Values are non-decreasing in row order (single-value columns only).
    pub sorted: bool,
    pub has_dictionary: bool,
    pub has_inverted_index: bool,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub string_column_max_length: u32,
    /// Chunk codec name of a raw forward index (`none`, `lz4`, `zstd`).
    pub compression: Option<String>,
}

/// How a column's forward index is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardIndexKind {
    SingleValue,
    MultiValue,
    Raw,
}

impl ColumnMetadata {
    pub fn forward_index_kind(&self) -> ForwardIndexKind {
        match (self.has_dictionary, self.single_value) {
            (false, _) => ForwardIndexKind::Raw,
            (true, true) => ForwardIndexKind::SingleValue,
            (true, false) => ForwardIndexKind::MultiValue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub name: String,
    pub table_name: String,
    pub version: u32,
    pub total_docs: u32,
    /// Columns in schema order.
    pub columns: Vec<ColumnMetadata>,
    pub time_column: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub creation_time_millis: i64,
    /// Crc over the segment's files, from `creation.meta`. Not part of `metadata.bin`.
    #[serde(skip)]
    pub crc: Option<u32>,
}

impl SegmentMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }
}

// --- file names ---

pub fn dictionary_file_name(column: &str) -> String {
    format!("{}.dict", column)
}

pub fn forward_index_file_name(column: &str, kind: ForwardIndexKind) -> String {
    match kind {
        ForwardIndexKind::SingleValue => format!("{}.sv.fwd", column),
        ForwardIndexKind::MultiValue => format!("{}.mv.fwd", column),
        ForwardIndexKind::Raw => format!("{}.raw.fwd", column),
    }
}

pub fn inverted_index_file_name(column: &str) -> String {
    format!("{}.inv", column)
}

// --- metadata.bin ---

/// Frame: magic(8) + version(u32) + len(u64) + crc32(u32) + bincode payload, big-endian.
pub fn encode_metadata(metadata: &SegmentMetadata) -> Result<Vec<u8>, QuarryError> {
    let bytes = bincode::serialize(metadata).map_err(|e| QuarryError::Serialization(e.to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(24 + bytes.len());
    out.extend_from_slice(METADATA_MAGIC);
    out.extend_from_slice(&METADATA_VERSION.to_be_bytes());
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&bytes);
    Ok(out)
}

pub fn read_metadata(path: &Path) -> Result<SegmentMetadata, QuarryError> {
    let bytes = fs::read(path)?;
    let mut cur = bytes.as_slice();
    let truncated = |_: QuarryError| QuarryError::corrupt("Truncated segment metadata", path);

    let mut magic = [0u8; 8];
    cur.read_exact(&mut magic).map_err(|e| truncated(QuarryError::Io(e)))?;
    if &magic != METADATA_MAGIC {
        return Err(QuarryError::corrupt("Bad segment metadata magic", path));
    }
    let version = read_u32(&mut cur).map_err(truncated)?;
    if version != METADATA_VERSION {
        return Err(QuarryError::corrupt(
            format!("Unsupported segment metadata version {}", version),
            path,
        ));
    }
    let len = read_u64(&mut cur).map_err(truncated)? as usize;
    let crc = read_u32(&mut cur).map_err(truncated)?;
    if cur.len() != len {
        return Err(QuarryError::corrupt(
            format!("Segment metadata payload is {} bytes, header says {}", cur.len(), len),
            path,
        ));
    }
    let mut hasher = Crc32::new();
    hasher.update(cur);
    if hasher.finalize() != crc {
        return Err(QuarryError::corrupt("Segment metadata CRC mismatch", path));
    }
    bincode::deserialize(cur)
        .map_err(|e| QuarryError::corrupt(format!("Undecodable segment metadata: {}", e), path))
}

// --- creation.meta ---

/// Contents of `creation.meta`: the segment crc and creation time, each an i64 big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationMeta {
    pub crc: i64,
    pub creation_time_millis: i64,
}

impl CreationMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        write_i64(&mut out, self.crc);
        write_i64(&mut out, self.creation_time_millis);
        out
    }

    pub fn read(path: &Path) -> Result<Self, QuarryError> {
        let bytes = fs::read(path)?;
        if bytes.len() != 16 {
            return Err(QuarryError::corrupt(
                format!("creation.meta is {} bytes, expected 16", bytes.len()),
                path,
            ));
        }
        let mut cur = bytes.as_slice();
        Ok(Self {
            crc: read_i64(&mut cur)?,
            creation_time_millis: read_i64(&mut cur)?,
        })
    }
}

/// Crc32 over the contents of every regular file in `dir` except `creation.meta`, visited in
/// file-name order.
pub fn compute_segment_crc(dir: &Path) -> Result<u32, QuarryError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != CREATION_META_FILE {
            names.push(name);
        }
    }
    names.sort();

    let mut hasher = Crc32::new();
    let mut buf = vec![0u8; 64 * 1024];
    for name in names {
        let mut f = File::open(dir.join(&name))?;
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hasher.finalize())
}

pub(crate) fn write_file_synced(path: &Path, bytes: &[u8]) -> Result<(), QuarryError> {
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?,
    );
    w.write_all(bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) -> Result<(), QuarryError> {
    File::open(dir)?.sync_data()?;
    Ok(())
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), QuarryError> {
    let parent = path
        .parent()
        .ok_or_else(|| QuarryError::Internal("Missing parent dir".to_string()))?;
    sync_dir(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SegmentMetadata {
        SegmentMetadata {
            name: "events_1_2".to_string(),
            table_name: "events".to_string(),
            version: SEGMENT_FORMAT_VERSION,
            total_docs: 3,
            columns: vec![ColumnMetadata {
                name: "country".to_string(),
                data_type: DataType::String,
                field_type: FieldType::Dimension,
                cardinality: 2,
                total_docs: 3,
                total_number_of_entries: 3,
                bits_per_element: 1,
                max_number_of_multi_values: 0,
                single_value: true,
                sorted: false,
                has_dictionary: true,
                has_inverted_index: true,
                min_value: Some(Value::from("de")),
                max_value: Some(Value::from("us")),
                string_column_max_length: 2,
                compression: None,
            }],
            time_column: None,
            start_time: None,
            end_time: None,
            creation_time_millis: 1_700_000_000_000,
            crc: None,
        }
    }

    #[test]
    fn metadata_frame_roundtrips_and_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let mut bytes = encode_metadata(&sample()).unwrap();
        write_file_synced(&path, &bytes).unwrap();
        assert_eq!(read_metadata(&path).unwrap(), sample());

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        match read_metadata(&path) {
            Err(QuarryError::CorruptSegment { details, .. }) => assert!(details.contains("CRC")),
            other => panic!("expected CorruptSegment, got {:?}", other),
        }
    }

    #[test]
    fn segment_crc_ignores_creation_meta_and_follows_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.fwd"), b"bbb").unwrap();
        fs::write(dir.path().join("a.dict"), b"aa").unwrap();
        let before = compute_segment_crc(dir.path()).unwrap();

        let meta = CreationMeta {
            crc: before as i64,
            creation_time_millis: 42,
        };
        fs::write(dir.path().join(CREATION_META_FILE), meta.encode()).unwrap();
        assert_eq!(compute_segment_crc(dir.path()).unwrap(), before);
        assert_eq!(CreationMeta::read(&dir.path().join(CREATION_META_FILE)).unwrap(), meta);

        let mut hasher = Crc32::new();
        hasher.update(b"aabbb");
        assert_eq!(before, hasher.finalize());
    }

    #[test]
    fn existing_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        write_file_synced(&path, b"1").unwrap();
        assert!(write_file_synced(&path, b"2").is_err());
    }
}
