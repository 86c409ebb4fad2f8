//! Opens sealed segment directories for querying.
//!
//! Loading is all-or-nothing: the directory crc is checked against `creation.meta`, the
//! metadata frame is validated, and every column reader is opened before a segment is
//! returned. Any malformed file rejects the whole segment.

use crate::buffer::{DataBuffer, ReadMode};
use crate::datasource::ColumnDataSource;
use crate::dictionary::Dictionary;
use crate::error::QuarryError;
use crate::forward_index::{ForwardIndex, MultiValueForwardIndex, RawForwardIndex, SingleValueForwardIndex};
use crate::inverted_index::{BitmapInvertedIndex, DEFAULT_MAX_CACHED_BITMAPS};
use crate::metadata::{
    compute_segment_crc, dictionary_file_name, forward_index_file_name, inverted_index_file_name, read_metadata,
    ColumnMetadata, CreationMeta, ForwardIndexKind, SegmentMetadata, CREATION_META_FILE, METADATA_FILE,
    SEGMENT_FORMAT_VERSION,
};
use crate::telemetry::quarry_metrics;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub read_mode: ReadMode,
    /// Bound on resident decoded bitmaps per inverted index.
    pub bitmap_cache_capacity: usize,
    pub verify_crc: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            read_mode: ReadMode::Heap,
            bitmap_cache_capacity: DEFAULT_MAX_CACHED_BITMAPS,
            verify_crc: true,
        }
    }
}

/// A loaded, read-only segment. `Send + Sync`; share it behind an `Arc`.
#[derive(Debug)]
pub struct ImmutableSegment {
    dir: PathBuf,
    metadata: SegmentMetadata,
    read_mode: ReadMode,
    columns: HashMap<String, Arc<ColumnDataSource>>,
}

impl ImmutableSegment {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    pub fn total_docs(&self) -> u32 {
        self.metadata.total_docs
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    pub fn crc(&self) -> Option<u32> {
        self.metadata.crc
    }

    pub fn data_source(&self, column: &str) -> Option<Arc<ColumnDataSource>> {
        self.columns.get(column).cloned()
    }

    /// Column names in schema order.
    pub fn column_names(&self) -> Vec<&str> {
        self.metadata.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Drops every cached inverted-index bitmap of every column.
    pub fn clear_bitmap_caches(&self) -> Result<(), QuarryError> {
        for source in self.columns.values() {
            if let Some(inv) = source.inverted_index() {
                inv.clear_cache()?;
            }
        }
        Ok(())
    }
}

pub fn load(path: &Path, read_mode: ReadMode) -> Result<Arc<ImmutableSegment>, QuarryError> {
    load_with_options(
        path,
        &LoadOptions {
            read_mode,
            ..LoadOptions::default()
        },
    )
}

pub fn load_with_options(path: &Path, options: &LoadOptions) -> Result<Arc<ImmutableSegment>, QuarryError> {
    let started = Instant::now();

    let creation_path = path.join(CREATION_META_FILE);
    let creation = CreationMeta::read(&creation_path).map_err(|e| match e {
        QuarryError::Io(io) if io.kind() == ErrorKind::NotFound => {
            QuarryError::corrupt("Missing creation.meta; not a sealed segment", path)
        }
        other => other,
    })?;
    if options.verify_crc {
        let actual = compute_segment_crc(path)?;
        if actual as i64 != creation.crc {
            return Err(QuarryError::corrupt(
                format!(
                    "Segment CRC mismatch: stored {:#010x}, computed {:#010x}",
                    creation.crc, actual
                ),
                path,
            ));
        }
    }

    let mut metadata = read_metadata(&path.join(METADATA_FILE))?;
    if metadata.version != SEGMENT_FORMAT_VERSION {
        return Err(QuarryError::corrupt(
            format!("Unsupported segment format version {}", metadata.version),
            path,
        ));
    }
    metadata.crc = Some(creation.crc as u32);

    let mut columns = HashMap::with_capacity(metadata.columns.len());
    for column in &metadata.columns {
        if column.total_docs != metadata.total_docs {
            return Err(QuarryError::corrupt(
                format!(
                    "Column {} has {} docs, segment has {}",
                    column.name, column.total_docs, metadata.total_docs
                ),
                path,
            ));
        }
        let source = open_column(path, column, options)?;
        columns.insert(column.name.clone(), Arc::new(source));
    }

    quarry_metrics::record_segment_loaded(started.elapsed());
    Ok(Arc::new(ImmutableSegment {
        dir: path.to_path_buf(),
        metadata,
        read_mode: options.read_mode,
        columns,
    }))
}

fn with_path(err: QuarryError, path: &Path) -> QuarryError {
    match err {
        QuarryError::CorruptSegment { details, path: None } => QuarryError::corrupt(details, path),
        QuarryError::OutOfRange { .. } => QuarryError::corrupt(err.to_string(), path),
        other => other,
    }
}

fn open_column(dir: &Path, column: &ColumnMetadata, options: &LoadOptions) -> Result<ColumnDataSource, QuarryError> {
    let open = |name: String| -> Result<(DataBuffer, PathBuf), QuarryError> {
        let p = dir.join(name);
        let buf = DataBuffer::open(&p, options.read_mode).map_err(|e| match e {
            QuarryError::Io(io) if io.kind() == ErrorKind::NotFound => {
                QuarryError::corrupt(format!("Missing file for column {}", column.name), &p)
            }
            other => other,
        })?;
        Ok((buf, p))
    };

    let dictionary = if column.has_dictionary {
        let (buf, p) = open(dictionary_file_name(&column.name))?;
        let dict = Dictionary::decode(&buf, &p)?;
        if dict.len() != column.cardinality || dict.data_type() != column.data_type {
            return Err(QuarryError::corrupt(
                format!(
                    "Dictionary of column {} is {} x {}, metadata says {} x {}",
                    column.name,
                    dict.len(),
                    dict.data_type(),
                    column.cardinality,
                    column.data_type
                ),
                &p,
            ));
        }
        Some(dict)
    } else {
        None
    };

    let kind = column.forward_index_kind();
    let (buf, p) = open(forward_index_file_name(&column.name, kind))?;
    let forward = match kind {
        ForwardIndexKind::SingleValue => {
            SingleValueForwardIndex::new(buf, column.total_docs, column.bits_per_element).map(ForwardIndex::SingleValue)
        }
        ForwardIndexKind::MultiValue => {
            MultiValueForwardIndex::new(buf, column.total_docs, column.bits_per_element).map(ForwardIndex::MultiValue)
        }
        ForwardIndexKind::Raw => RawForwardIndex::open(buf, &p).map(ForwardIndex::Raw),
    }
    .map_err(|e| with_path(e, &p))?;

    let inverted = if column.has_inverted_index {
        let (buf, p) = open(inverted_index_file_name(&column.name))?;
        Some(
            BitmapInvertedIndex::open(buf, column.cardinality, options.bitmap_cache_capacity, &p)
                .map_err(|e| with_path(e, &p))?,
        )
    } else {
        None
    };

    ColumnDataSource::new(column.clone(), dictionary, forward, inverted).map_err(|e| with_path(e, dir))
}
