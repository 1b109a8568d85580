use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::trace;

/// A bounded LRU cache of decompressed seek table entries.
///
/// Keys are entry indices, values are the owned decompressed bytes of the
/// entry. Recency is an atomic stamp per entry, so [`FrameCache::find`] works
/// through a shared reference and can run under the reader's shared lock;
/// eviction picks the minimum stamp, which makes eviction follow insertion
/// order until a `find` promotes an entry.
#[derive(Debug)]
pub(crate) struct FrameCache {
    entries: HashMap<u32, CacheEntry>,
    capacity: usize,
    bytes: usize,
    tick: AtomicU64,
}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    stamp: AtomicU64,
}

impl FrameCache {
    /// Creates a cache holding at most `capacity` entries. `capacity` must be
    /// at least 1; a reader without caching doesn't construct a cache at all.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            bytes: 0,
            tick: AtomicU64::new(0),
        }
    }

    /// Looks up the entry at `index` and promotes it to most-recently-used.
    pub(crate) fn find(&self, index: u32) -> Option<&[u8]> {
        let entry = self.entries.get(&index)?;
        entry.stamp.store(self.next_tick(), Ordering::Relaxed);
        Some(&entry.data)
    }

    /// Inserts the decompressed bytes of the entry at `index`, taking
    /// ownership of `data`.
    ///
    /// Fails (returns `false`) when an entry with the same index is already
    /// present. When the cache is full, the least-recently-used entry is
    /// evicted first.
    pub(crate) fn insert(&mut self, index: u32, data: Vec<u8>) -> bool {
        if self.entries.contains_key(&index) {
            return false;
        }

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        self.bytes += data.len();
        let stamp = AtomicU64::new(self.next_tick());
        self.entries.insert(index, CacheEntry { data, stamp });

        true
    }

    /// The number of cached entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The total number of decompressed bytes owned by the cache.
    pub(crate) fn memory_usage(&self) -> usize {
        self.bytes
    }

    fn evict_lru(&mut self) {
        let lru = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stamp.load(Ordering::Relaxed))
            .map(|(index, _)| *index);

        if let Some(index) = lru {
            let entry = self.entries.remove(&index).expect("LRU entry is present");
            self.bytes -= entry.data.len();
            trace!(index, bytes = entry.data.len(), "evicted cached entry");
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }
}
