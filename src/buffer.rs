//! Read-only byte buffers backing segment indexes: either owned heap bytes or a memory map.
//!
//! A `DataBuffer` is a cheap, cloneable view (`Arc` + range) over one backing region. The
//! segment loader creates one backing region per file; every reader holds a clone of the view,
//! so the mapping stays alive until the last in-flight reader drops it. Readers never unmap.

use crate::error::QuarryError;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;

/// How a segment's files are brought into memory. Serde: lowercase string (`"heap"`, `"mmap"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Read every file fully into heap memory.
    #[default]
    Heap,
    /// Memory-map every file read-only.
    Mmap,
}

impl std::str::FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heap" => Ok(ReadMode::Heap),
            "mmap" => Ok(ReadMode::Mmap),
            other => Err(format!("unknown read mode {:?} (expected heap or mmap)", other)),
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadMode::Heap => f.write_str("heap"),
            ReadMode::Mmap => f.write_str("mmap"),
        }
    }
}

enum Backing {
    Heap(Vec<u8>),
    Mmap(Mmap),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Heap(v) => v,
            Backing::Mmap(m) => m,
        }
    }
}

#[derive(Clone)]
pub struct DataBuffer {
    backing: Arc<Backing>,
    start: usize,
    len: usize,
}

impl DataBuffer {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            backing: Arc::new(Backing::Heap(bytes)),
            start: 0,
            len,
        }
    }

    /// Opens `path` as a buffer using the given read mode.
    ///
    /// Empty files are always heap-backed (a zero-length mapping is not portable).
    pub fn open(path: &Path, mode: ReadMode) -> Result<Self, QuarryError> {
        match mode {
            ReadMode::Heap => Ok(Self::from_vec(std::fs::read(path)?)),
            ReadMode::Mmap => {
                let file = File::open(path)?;
                if file.metadata()?.len() == 0 {
                    return Ok(Self::from_vec(Vec::new()));
                }
                // SAFETY: sealed segment files are immutable; nothing in this crate writes to a
                // file after it has been published under its final name.
                let mmap = unsafe { Mmap::map(&file)? };
                let len = mmap.len();
                Ok(Self {
                    backing: Arc::new(Backing::Mmap(mmap)),
                    start: 0,
                    len,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mmap(&self) -> bool {
        matches!(*self.backing, Backing::Mmap(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.backing.bytes()[self.start..self.start + self.len]
    }

    /// A sub-view sharing the same backing region.
    pub fn slice(&self, range: Range<usize>) -> Result<DataBuffer, QuarryError> {
        if range.start > range.end || range.end > self.len {
            return Err(QuarryError::out_of_range(
                "buffer byte",
                range.end as u64,
                self.len as u64,
            ));
        }
        Ok(DataBuffer {
            backing: Arc::clone(&self.backing),
            start: self.start + range.start,
            len: range.end - range.start,
        })
    }

    /// Number of live views (including this one) over the backing region.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.backing)
    }
}

impl Deref for DataBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("mmap", &self.is_mmap())
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}
