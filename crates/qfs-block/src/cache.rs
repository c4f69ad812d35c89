use qfs_types::{DEV_BSIZE, Ordinal};
use std::collections::VecDeque;

/// Read-cache capacity in entries.
pub const CACHE_ENTRIES: usize = 16;

#[derive(Debug)]
struct Entry {
    ord: Ordinal,
    block: u64,
    data: Vec<u8>,
}

impl Entry {
    fn end_block(&self) -> u64 {
        self.block + (self.data.len() as u64).div_ceil(u64::from(DEV_BSIZE))
    }

    fn overlaps(&self, ord: Ordinal, block: u64, end: u64) -> bool {
        self.ord == ord && self.block < end && block < self.end_block()
    }
}

/// Fixed-capacity most-recently-used cache of physical block runs.
///
/// A lookup hits only when a cached run starts at the requested block and
/// is at least as long as the request. Any write invalidates every run it
/// overlaps.
#[derive(Debug)]
pub struct MruCache {
    capacity: usize,
    /// Front is most recently used.
    entries: VecDeque<Entry>,
}

impl Default for MruCache {
    fn default() -> Self {
        Self::new(CACHE_ENTRIES)
    }
}

impl MruCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Copy cached bytes into `buf` on a hit.
    pub fn lookup(&mut self, ord: Ordinal, block: u64, buf: &mut [u8]) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.ord == ord && e.block == block && e.data.len() >= buf.len())
        else {
            return false;
        };
        if let Some(entry) = self.entries.remove(pos) {
            buf.copy_from_slice(&entry.data[..buf.len()]);
            self.entries.push_front(entry);
            return true;
        }
        false
    }

    pub fn insert(&mut self, ord: Ordinal, block: u64, data: &[u8]) {
        let end = block + (data.len() as u64).div_ceil(u64::from(DEV_BSIZE));
        self.invalidate(ord, block, end);
        if self.entries.len() == self.capacity {
            let _ = self.entries.pop_back();
        }
        self.entries.push_front(Entry {
            ord,
            block,
            data: data.to_vec(),
        });
    }

    /// Drop every run overlapping device blocks `[block, end)`.
    pub fn invalidate(&mut self, ord: Ordinal, block: u64, end: u64) {
        self.entries.retain(|e| !e.overlaps(ord, block, end));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_requires_same_start_and_enough_length() {
        let mut cache = MruCache::new(4);
        cache.insert(Ordinal(0), 10, &[5_u8; 2048]);
        let mut buf = [0_u8; 1024];
        assert!(cache.lookup(Ordinal(0), 10, &mut buf));
        assert_eq!(buf, [5_u8; 1024]);
        assert!(!cache.lookup(Ordinal(0), 11, &mut buf));
        assert!(!cache.lookup(Ordinal(1), 10, &mut buf));
        let mut big = [0_u8; 4096];
        assert!(!cache.lookup(Ordinal(0), 10, &mut big));
    }

    #[test]
    fn write_invalidates_overlapping_runs() {
        let mut cache = MruCache::new(4);
        cache.insert(Ordinal(0), 10, &[1_u8; 4096]);
        cache.insert(Ordinal(0), 20, &[2_u8; 1024]);
        cache.invalidate(Ordinal(0), 13, 14);
        let mut buf = [0_u8; 1024];
        assert!(!cache.lookup(Ordinal(0), 10, &mut buf));
        assert!(cache.lookup(Ordinal(0), 20, &mut buf));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = MruCache::new(2);
        let mut buf = [0_u8; 1024];
        cache.insert(Ordinal(0), 1, &[1_u8; 1024]);
        cache.insert(Ordinal(0), 2, &[2_u8; 1024]);
        assert!(cache.lookup(Ordinal(0), 1, &mut buf));
        cache.insert(Ordinal(0), 3, &[3_u8; 1024]);
        assert!(cache.lookup(Ordinal(0), 1, &mut buf));
        assert!(!cache.lookup(Ordinal(0), 2, &mut buf));
        assert_eq!(cache.len(), 2);
    }
}
