//! Bitmap inverted index ("dictionary id → doc ids") with a lazy, bounded bitmap cache.
//!
//! File layout: `num_bitmaps + 1` big-endian i32 absolute offsets, followed by the roaring
//! portable serialization of each bitmap. `offset[0] == 4 * (num_bitmaps + 1)` and
//! `offset[num_bitmaps]` equals the file length.
//!
//! Bitmaps are decoded on first access and kept in a per-id slot. Each slot has its own lock,
//! so lookups for different ids never contend. A small FIFO of resident ids bounds the cache;
//! a thread never holds a slot lock while taking the FIFO lock.

use crate::buffer::DataBuffer;
use crate::encoding::{i32_at, write_i32};
use crate::error::QuarryError;
use crate::telemetry::quarry_metrics;

use roaring::RoaringBitmap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Default bound on resident decoded bitmaps per inverted index.
pub const DEFAULT_MAX_CACHED_BITMAPS: usize = 4096;

/// Accumulates one bitmap per dictionary id during segment creation.
#[derive(Debug)]
pub struct InvertedIndexCreator {
    bitmaps: Vec<RoaringBitmap>,
}

impl InvertedIndexCreator {
    pub fn new(cardinality: u32) -> Self {
        Self {
            bitmaps: vec![RoaringBitmap::new(); cardinality as usize],
        }
    }

    pub fn add(&mut self, doc: u32, dict_id: u32) -> Result<(), QuarryError> {
        let card = self.bitmaps.len() as u64;
        let bitmap = self
            .bitmaps
            .get_mut(dict_id as usize)
            .ok_or_else(|| QuarryError::out_of_range("dictionary id", dict_id as u64, card))?;
        bitmap.insert(doc);
        Ok(())
    }

    /// Multi-value rows: every entry of the row maps back to the doc.
    pub fn add_multi(&mut self, doc: u32, dict_ids: &[u32]) -> Result<(), QuarryError> {
        for &id in dict_ids {
            self.add(doc, id)?;
        }
        Ok(())
    }

    pub fn seal(self) -> Result<Vec<u8>, QuarryError> {
        let header_len = 4 * (self.bitmaps.len() + 1);
        let mut body = Vec::new();
        let mut offsets = Vec::with_capacity(self.bitmaps.len() + 1);
        for bitmap in &self.bitmaps {
            offsets.push(header_len + body.len());
            bitmap.serialize_into(&mut body)?;
        }
        offsets.push(header_len + body.len());

        let mut out = Vec::with_capacity(header_len + body.len());
        for off in offsets {
            let off = i32::try_from(off)
                .map_err(|_| QuarryError::Internal("Inverted index larger than 2 GiB".to_string()))?;
            write_i32(&mut out, off);
        }
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Hit/miss/eviction counters of one index's bitmap cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitmapCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct BitmapInvertedIndex {
    buffer: DataBuffer,
    offsets: Vec<u32>,
    slots: Box<[Mutex<Option<Arc<RoaringBitmap>>>]>,
    resident: Mutex<VecDeque<u32>>,
    max_cached: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    path: PathBuf,
}

impl BitmapInvertedIndex {
    /// Validates the offset table; bitmaps themselves are decoded lazily.
    pub fn open(
        buffer: DataBuffer,
        num_bitmaps: u32,
        max_cached: usize,
        path: &Path,
    ) -> Result<Self, QuarryError> {
        let n = num_bitmaps as usize;
        let header_len = 4 * (n + 1);
        let mut offsets = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let off = i32_at(&buffer, i * 4)
                .ok_or_else(|| QuarryError::corrupt("Truncated inverted index offset table", path))?;
            let off = u32::try_from(off)
                .map_err(|_| QuarryError::corrupt(format!("Negative inverted index offset {}", off), path))?;
            offsets.push(off);
        }
        if offsets[0] as usize != header_len {
            return Err(QuarryError::corrupt(
                format!(
                    "Inverted index data starts at {}, expected {}",
                    offsets[0], header_len
                ),
                path,
            ));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets[n] as usize != buffer.len() {
            return Err(QuarryError::corrupt("Inverted index offsets are inconsistent", path));
        }
        let slots = (0..n).map(|_| Mutex::new(None)).collect::<Vec<_>>().into_boxed_slice();
        Ok(Self {
            buffer,
            offsets,
            slots,
            resident: Mutex::new(VecDeque::new()),
            max_cached,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            path: path.to_path_buf(),
        })
    }

    pub fn num_bitmaps(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Docs whose value has dictionary id `dict_id`.
    ///
    /// Concurrent first lookups of one id decode it once; every caller gets the same bitmap.
    pub fn get_doc_ids(&self, dict_id: u32) -> Result<Arc<RoaringBitmap>, QuarryError> {
        let slot = self.slots.get(dict_id as usize).ok_or_else(|| {
            QuarryError::out_of_range("dictionary id", dict_id as u64, self.slots.len() as u64)
        })?;

        let bitmap = {
            let mut guard = slot.lock()?;
            if let Some(bitmap) = guard.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                quarry_metrics::record_bitmap_cache_hit();
                return Ok(Arc::clone(bitmap));
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            quarry_metrics::record_bitmap_cache_miss();
            let bitmap = Arc::new(self.decode(dict_id)?);
            *guard = Some(Arc::clone(&bitmap));
            bitmap
        };
        self.admit(dict_id)?;
        Ok(bitmap)
    }

    fn decode(&self, dict_id: u32) -> Result<RoaringBitmap, QuarryError> {
        let start = self.offsets[dict_id as usize] as usize;
        let end = self.offsets[dict_id as usize + 1] as usize;
        RoaringBitmap::deserialize_from(&self.buffer[start..end]).map_err(|e| {
            QuarryError::corrupt(format!("Bitmap {} does not decode: {}", dict_id, e), &self.path)
        })
    }

    fn admit(&self, dict_id: u32) -> Result<(), QuarryError> {
        let victims: Vec<u32> = {
            let mut resident = self.resident.lock()?;
            // a clear_cache racing a miss can leave the id queued with an empty slot
            if resident.contains(&dict_id) {
                return Ok(());
            }
            resident.push_back(dict_id);
            let excess = resident.len().saturating_sub(self.max_cached);
            resident.drain(..excess).collect()
        };
        for victim in &victims {
            *self.slots[*victim as usize].lock()? = None;
        }
        if !victims.is_empty() {
            self.evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
            quarry_metrics::record_bitmap_cache_evictions(victims.len() as u64);
        }
        Ok(())
    }

    /// Drops every cached bitmap. Bitmaps already handed out stay valid.
    pub fn clear_cache(&self) -> Result<(), QuarryError> {
        self.resident.lock()?.clear();
        for slot in self.slots.iter() {
            *slot.lock()? = None;
        }
        Ok(())
    }

    pub fn cached_count(&self) -> Result<usize, QuarryError> {
        Ok(self.resident.lock()?.len())
    }

    pub fn cache_stats(&self) -> BitmapCacheStats {
        BitmapCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(ids: &[u32], cardinality: u32, max_cached: usize) -> BitmapInvertedIndex {
        let mut creator = InvertedIndexCreator::new(cardinality);
        for (doc, id) in ids.iter().enumerate() {
            creator.add(doc as u32, *id).unwrap();
        }
        let bytes = creator.seal().unwrap();
        BitmapInvertedIndex::open(DataBuffer::from_vec(bytes), cardinality, max_cached, Path::new("c.inv")).unwrap()
    }

    #[test]
    fn header_offsets_are_absolute() {
        let mut creator = InvertedIndexCreator::new(2);
        creator.add(0, 1).unwrap();
        let bytes = creator.seal().unwrap();
        assert_eq!(i32_at(&bytes, 0), Some(12));
        assert_eq!(i32_at(&bytes, 8), Some(bytes.len() as i32));
    }

    #[test]
    fn lookups_past_cardinality_are_out_of_range() {
        let index = index_of(&[0, 1], 2, 8);
        assert!(matches!(index.get_doc_ids(2), Err(QuarryError::OutOfRange { .. })));
    }

    #[test]
    fn cache_stays_within_bound() {
        let index = index_of(&[0, 1, 2, 3, 0, 1, 2, 3], 4, 2);
        for id in 0..4 {
            assert_eq!(index.get_doc_ids(id).unwrap().len(), 2);
        }
        assert_eq!(index.cached_count().unwrap(), 2);
        let stats = index.cache_stats();
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.evictions, 2);

        // ids 2 and 3 are resident
        index.get_doc_ids(3).unwrap();
        assert_eq!(index.cache_stats().hits, 1);
    }

    #[test]
    fn cached_bitmap_is_shared() {
        let index = index_of(&[0, 0, 1], 2, 8);
        let a = index.get_doc_ids(0).unwrap();
        let b = index.get_doc_ids(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        index.clear_cache().unwrap();
        let c = index.get_doc_ids(0).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(*a, *c);
    }

    #[test]
    fn stale_queue_entry_is_not_counted_twice() {
        let index = index_of(&[0, 1, 2, 0], 3, 2);
        index.get_doc_ids(0).unwrap();
        // clear lands between a miss's decode and its admit
        index.clear_cache().unwrap();
        index.admit(0).unwrap();
        assert_eq!(index.cached_count().unwrap(), 1);

        index.get_doc_ids(0).unwrap();
        assert_eq!(index.cached_count().unwrap(), 1);
        index.get_doc_ids(1).unwrap();
        assert_eq!(index.cached_count().unwrap(), 2);
        assert_eq!(index.cache_stats().evictions, 0);
    }

    #[test]
    fn truncated_offsets_are_corrupt() {
        let err = BitmapInvertedIndex::open(DataBuffer::from_vec(vec![0, 0, 0]), 1, 8, Path::new("x.inv"))
            .unwrap_err();
        assert!(matches!(err, QuarryError::CorruptSegment { .. }));
    }
}
