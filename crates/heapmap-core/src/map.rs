//! HeapMap: the public map API.
//!
//! A [`HeapMap`] couples a [`TableCore`] with an eviction policy `P`, a byte
//! heap `H` and a slot storage `S`. The policy is a strategy value; the map
//! routes every structural change through its hooks.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use heapmap_core::{HeapMap, MapConfig, StoredKeys};
//!
//! let mut map = HeapMap::new(MapConfig::store(), Arc::new(StoredKeys)).unwrap();
//! map.put(b"key", b"value").unwrap();
//! assert_eq!(map.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::config::MapConfig;
use crate::error::{MapError, MapResult};
use crate::eviction::{EvictionPolicy, Fifo, Lru, Priority, Unbounded};
use crate::heap::{shared, ByteHeap, LruHeap, LruMemHeap, MemHeap, SharedHeap};
use crate::keys::KeyRelation;
use crate::storage::{PackedSlots, SlotStorage};
use crate::table::{MapEntry, PutOutcome, ScanCursor, TableCore, TableItem, TableStats};

/// Hash map over a byte heap with a pluggable eviction policy.
pub struct HeapMap<P = Unbounded, H = MemHeap, S = PackedSlots>
where
    H: ByteHeap,
    S: SlotStorage,
    P: EvictionPolicy<H, S>,
{
    core: TableCore<H, S>,
    policy: P,
}

/// Bounded map evicting in insertion order
pub type FifoMap = HeapMap<Fifo, MemHeap>;

/// Bounded map evicting the least recently used key
pub type LruMap = HeapMap<Lru, LruMemHeap>;

/// Bounded map evicting low-priority keys in amortized sweeps
pub type PriorityMap = HeapMap<Priority, MemHeap>;

impl HeapMap<Unbounded, MemHeap, PackedSlots> {
    /// Unbounded map with its own heap.
    pub fn new(config: MapConfig, keys: Arc<dyn KeyRelation>) -> MapResult<Self> {
        Self::with_policy(config, keys, Unbounded)
    }
}

impl HeapMap<Fifo, MemHeap, PackedSlots> {
    /// FIFO map bounded by `config.max_elements`.
    pub fn fifo(config: MapConfig, keys: Arc<dyn KeyRelation>) -> MapResult<Self> {
        let policy = Fifo::new(config.max_elements);
        Self::with_policy(config, keys, policy)
    }
}

impl HeapMap<Lru, LruMemHeap, PackedSlots> {
    /// LRU map bounded by `config.max_elements`.
    pub fn lru(config: MapConfig, keys: Arc<dyn KeyRelation>) -> MapResult<Self> {
        let policy = Lru::new(config.max_elements);
        Self::with_policy(config, keys, policy)
    }
}

impl HeapMap<Priority, MemHeap, PackedSlots> {
    /// Priority map bounded by `config.max_elements`.
    pub fn priority(config: MapConfig, keys: Arc<dyn KeyRelation>) -> MapResult<Self> {
        let policy = Priority::from_config(&config);
        Self::with_policy(config, keys, policy)
    }
}

impl<P, H, S> HeapMap<P, H, S>
where
    H: ByteHeap + Default,
    S: SlotStorage,
    P: EvictionPolicy<H, S>,
{
    /// Map owning a fresh heap sized by `config.heap_max_memory`.
    pub fn with_policy(config: MapConfig, keys: Arc<dyn KeyRelation>, policy: P) -> MapResult<Self> {
        let mut heap = H::default();
        heap.initialize();
        let core = TableCore::new(&config, keys, shared(heap), false)?;
        Ok(Self { core, policy })
    }
}

impl<P, H, S> HeapMap<P, H, S>
where
    H: ByteHeap,
    S: SlotStorage,
    P: EvictionPolicy<H, S>,
{
    /// Map living in a heap shared with other tables. The map never
    /// compacts a shared heap on its own, see [`HeapMap::mark_live_offsets`].
    pub fn with_shared_heap(
        config: MapConfig,
        keys: Arc<dyn KeyRelation>,
        policy: P,
        heap: SharedHeap<H>,
    ) -> MapResult<Self> {
        let core = TableCore::new(&config, keys, heap, true)?;
        Ok(Self { core, policy })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Read access to the table core (statistics, diagnostics).
    pub fn core(&self) -> &TableCore<H, S> {
        &self.core
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Value of `key`. A key mapped to null reads as `None`; use
    /// [`HeapMap::get_entry`] to tell it apart from a missing key.
    pub fn get(&mut self, key: &[u8]) -> MapResult<Option<Vec<u8>>> {
        Ok(self.get_entry(key)?.flatten())
    }

    /// `Some(value)` when the key is present, where `value` is None for null.
    pub fn get_entry(&mut self, key: &[u8]) -> MapResult<Option<Option<Vec<u8>>>> {
        match self.core.lookup(key)? {
            Some(found) => {
                self.policy.after_access(&mut self.core, found.offset)?;
                Ok(Some(found.value))
            }
            None => Ok(None),
        }
    }

    pub fn get_or_default(&mut self, key: &[u8], default: &[u8]) -> MapResult<Vec<u8>> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_vec()))
    }

    pub fn contains_key(&self, key: &[u8]) -> MapResult<bool> {
        self.core.contains_key(key)
    }

    pub fn contains_value(&self, value: &[u8]) -> MapResult<bool> {
        self.core.contains_value(value)
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    fn put_val(&mut self, key: &[u8], value: Option<&[u8]>, overwrite: bool) -> MapResult<Option<Vec<u8>>> {
        self.policy.before_insert(&mut self.core)?;
        let policy = &mut self.policy;
        let outcome = self.core.put_val(key, value, overwrite, &mut || policy.new_metadata())?;
        match outcome {
            PutOutcome::Inserted { offset } => {
                self.policy.after_insert(&mut self.core, offset)?;
                Ok(None)
            }
            PutOutcome::Replaced { offset, old, previous } => {
                self.policy.after_remove(&mut self.core, &old)?;
                self.policy.after_insert(&mut self.core, offset)?;
                Ok(previous)
            }
            PutOutcome::Unchanged { previous, .. } => Ok(previous),
        }
    }

    /// Store `key -> value`, returning the previous value.
    ///
    /// Unless the map stores keys, `key` must be the key the relation
    /// computes for `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> MapResult<Option<Vec<u8>>> {
        self.put_val(key, Some(value), true)
    }

    /// Store `value` under the key the relation derives from it.
    pub fn put_value(&mut self, value: &[u8]) -> MapResult<Option<Vec<u8>>> {
        let key = self.core.key_relation().compute_key(value).ok_or(MapError::KeyNotDerivable)?;
        self.put_val(&key, Some(value), true)
    }

    /// Store only if `key` is absent. Returns the existing value otherwise.
    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> MapResult<Option<Vec<u8>>> {
        self.put_val(key, Some(value), false)
    }

    /// Map `key` to null. Needs `support_null_values`.
    pub fn put_null(&mut self, key: &[u8]) -> MapResult<Option<Vec<u8>>> {
        self.put_val(key, None, true)
    }

    pub fn put_all<'a, I>(&mut self, entries: I) -> MapResult<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn check_removals(&self) -> MapResult<()> {
        if !self.core.flags().allow_removals {
            return Err(MapError::RemovalsNotAllowed);
        }
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> MapResult<Option<Vec<u8>>> {
        self.check_removals()?;
        match self.core.remove_node(key)? {
            Some(entry) => {
                self.policy.after_remove(&mut self.core, &entry)?;
                Ok(entry.value)
            }
            None => Ok(None),
        }
    }

    /// Remove every entry for which `predicate(key, value)` holds.
    /// Returns how many were removed.
    pub fn remove_if<F>(&mut self, mut predicate: F) -> MapResult<usize>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> bool,
    {
        self.check_removals()?;
        let before = self.core.len();
        let capacity = self.core.capacity();
        let policy = &mut self.policy;
        self.core.sweep(
            0,
            capacity,
            false,
            |entry| {
                let key = entry.key()?;
                Ok(predicate(&key[..], entry.value()?))
            },
            |core, removed| policy.after_remove(core, &removed),
        )?;
        Ok(before - self.core.len())
    }

    pub fn clear(&mut self) -> MapResult<()> {
        self.core.clear()?;
        self.policy.on_clear();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Traversal and diagnostics
    // ---------------------------------------------------------------

    pub fn keys(&self) -> MapResult<Vec<Vec<u8>>> {
        self.core.keys()
    }

    pub fn values(&self) -> MapResult<Vec<Option<Vec<u8>>>> {
        self.core.values()
    }

    pub fn for_each<F>(&self, f: F) -> MapResult<()>
    where
        F: FnMut(&[u8], Option<&[u8]>),
    {
        self.core.for_each(f)
    }

    pub fn cursor(&self) -> ScanCursor {
        self.core.cursor()
    }

    pub fn next_entry(&self, cursor: &mut ScanCursor) -> MapResult<Option<MapEntry>> {
        self.core.next_entry(cursor)
    }

    pub fn count_elements(&self) -> usize {
        self.core.count_elements()
    }

    pub fn longest_filled_run(&self) -> usize {
        self.core.longest_filled_run()
    }

    pub fn average_filled_run(&self) -> MapResult<f64> {
        self.core.average_filled_run()
    }

    pub fn stats(&self) -> TableStats {
        self.core.stats()
    }

    pub fn table_items(&self) -> MapResult<Vec<TableItem>> {
        self.core.table_items()
    }

    /// Compact an owned heap. Shared heaps are left alone.
    pub fn compress_heap(&mut self) -> MapResult<()> {
        self.core.compress_heap()
    }

    /// Mark this map's live offsets inside a remap pass on a shared heap:
    ///
    /// ```text
    ///   let mut heap = shared.lock();
    ///   heap.begin_remap();
    ///   a.mark_live_offsets(&mut heap);
    ///   b.mark_live_offsets(&mut heap);
    ///   heap.end_remap();
    /// ```
    pub fn mark_live_offsets(&self, heap: &mut H) {
        self.core.mark_live_offsets(heap)
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    /// File the slot array is saved to; the header goes next to it.
    pub fn set_path(&mut self, path: impl AsRef<Path>) {
        self.core.set_path(path.as_ref());
    }

    /// Write the slot array and header. The heap is persisted by its owner.
    pub fn save(&mut self) -> MapResult<()> {
        let state = self.policy.state();
        self.core.save(&state)
    }

    /// Replace the table with the persisted one at the configured path.
    pub fn load(&mut self) -> MapResult<()> {
        let state = self.core.load()?;
        self.policy.restore(&state)
    }
}

impl<H, S> HeapMap<Priority, H, S>
where
    H: ByteHeap,
    S: SlotStorage,
{
    /// Stored priority of `key`.
    pub fn priority_of(&self, key: &[u8]) -> MapResult<Option<u32>> {
        Ok(self.core.metadata_of(key)?.and_then(|m| {
            (m.len() >= 4).then(|| u32::from_be_bytes([m[0], m[1], m[2], m[3]]))
        }))
    }

    pub fn min_priority(&self) -> u32 {
        self.policy.min_priority()
    }

    pub fn current_priority(&self) -> u32 {
        self.policy.current_priority()
    }

    pub fn reprioritize(&mut self) -> MapResult<()> {
        self.policy.reprioritize(&mut self.core)
    }
}

impl<H, S> HeapMap<Lru, H, S>
where
    H: LruHeap,
    S: SlotStorage,
{
    /// Key that would be evicted next.
    pub fn eldest_key(&self) -> MapResult<Option<Vec<u8>>> {
        let oldest = self.core.heap().lock().oldest();
        let Some(offset) = oldest else {
            return Ok(None);
        };
        match self.core.locate_offset(offset)? {
            Some(index) => Ok(self.core.entry_at(index)?.map(|e| e.key)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrefixKeys, StoredKeys};

    fn store_map() -> HeapMap {
        HeapMap::new(MapConfig::store(), Arc::new(StoredKeys)).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let mut map = store_map();
        assert_eq!(map.put(b"a", b"1").unwrap(), None);
        assert_eq!(map.put(b"a", b"2").unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(map.remove(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(map.get(b"a").unwrap(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_zero_length_and_null_values() {
        let mut map = store_map();
        map.put(b"empty", b"").unwrap();
        map.put_null(b"null").unwrap();
        assert_eq!(map.get_entry(b"empty").unwrap(), Some(Some(Vec::new())));
        assert_eq!(map.get_entry(b"null").unwrap(), Some(None));
        assert_eq!(map.get_entry(b"missing").unwrap(), None);
        assert_eq!(map.get_or_default(b"missing", b"d").unwrap(), b"d".to_vec());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_removals_disabled() {
        let mut config = MapConfig::store();
        config.flags.allow_removals = false;
        let mut map = HeapMap::new(config, Arc::new(StoredKeys)).unwrap();
        map.put(b"a", b"1").unwrap();
        assert!(matches!(map.remove(b"a"), Err(MapError::RemovalsNotAllowed)));
        assert!(matches!(map.remove_if(|_, _| true), Err(MapError::RemovalsNotAllowed)));
        assert!(map.contains_key(b"a").unwrap());
    }

    #[test]
    fn test_put_if_absent_and_put_all() {
        let mut map = store_map();
        map.put_all([(&b"x"[..], &b"1"[..]), (&b"y"[..], &b"2"[..])]).unwrap();
        assert_eq!(map.put_if_absent(b"x", b"9").unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.put_if_absent(b"z", b"3").unwrap(), None);
        assert_eq!(map.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.len(), 3);
        assert!(map.contains_value(b"3").unwrap());
        assert!(!map.contains_value(b"9").unwrap());
    }

    #[test]
    fn test_put_value_derives_key() {
        let mut config = MapConfig::store();
        config.flags.variable_length_keys = false;
        let mut map = HeapMap::new(config, Arc::new(PrefixKeys::new(4))).unwrap();
        map.put_value(b"abcd:payload").unwrap();
        assert_eq!(map.get(b"abcd").unwrap(), Some(b"abcd:payload".to_vec()));

        let mut stored = store_map();
        assert!(matches!(stored.put_value(b"v"), Err(MapError::KeyNotDerivable)));
    }

    #[test]
    fn test_remove_if() {
        let mut map = store_map();
        for i in 0..50u8 {
            map.put(&[i], &[i % 5]).unwrap();
        }
        let removed = map.remove_if(|_, v| v == Some(&[0u8][..])).unwrap();
        assert_eq!(removed, 10);
        assert_eq!(map.len(), 40);
        assert_eq!(map.count_elements(), 40);
        for i in 0..50u8 {
            assert_eq!(map.contains_key(&[i]).unwrap(), i % 5 != 0);
        }
    }

    #[test]
    fn test_clear_and_reuse() {
        let mut map = store_map();
        map.put(b"a", b"1").unwrap();
        map.clear().unwrap();
        assert!(map.is_empty());
        map.put(b"b", b"2").unwrap();
        assert_eq!(map.keys().unwrap(), vec![b"b".to_vec()]);
        assert_eq!(map.values().unwrap(), vec![Some(b"2".to_vec())]);
    }

    #[test]
    fn test_fifo_evicts_oldest() {
        let mut map = FifoMap::fifo(MapConfig::cache(3), Arc::new(StoredKeys)).unwrap();
        for k in [b"a", b"b", b"c", b"d"] {
            map.put(k, b"v").unwrap();
        }
        assert_eq!(map.len(), 3);
        assert!(!map.contains_key(b"a").unwrap());
        // reads don't change FIFO order
        map.get(b"b").unwrap();
        map.put(b"e", b"v").unwrap();
        assert!(!map.contains_key(b"b").unwrap());
        assert!(map.contains_key(b"c").unwrap());
    }

    #[test]
    fn test_fifo_remove_middle_then_evict() {
        let mut map = FifoMap::fifo(MapConfig::cache(3), Arc::new(StoredKeys)).unwrap();
        for k in [b"a", b"b", b"c"] {
            map.put(k, b"v").unwrap();
        }
        map.remove(b"b").unwrap();
        map.put(b"d", b"v").unwrap();
        map.put(b"e", b"v").unwrap();
        assert_eq!(map.len(), 3);
        assert!(!map.contains_key(b"a").unwrap());
        for k in [b"c", b"d", b"e"] {
            assert!(map.contains_key(k).unwrap());
        }
        assert_eq!(map.policy().tracked(), 3);
    }

    #[test]
    fn test_lru_refreshes_on_access() {
        let mut map = LruMap::lru(MapConfig::cache(3), Arc::new(StoredKeys)).unwrap();
        for k in [b"a", b"b", b"c"] {
            map.put(k, b"v").unwrap();
        }
        map.get(b"a").unwrap();
        assert_eq!(map.eldest_key().unwrap(), Some(b"b".to_vec()));
        map.put(b"d", b"v").unwrap();
        assert!(map.contains_key(b"a").unwrap());
        assert!(!map.contains_key(b"b").unwrap());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_priority_access_refresh() {
        let mut map = PriorityMap::priority(MapConfig::cache(100), Arc::new(StoredKeys)).unwrap();
        map.put(b"a", b"1").unwrap();
        map.put(b"b", b"2").unwrap();
        assert_eq!(map.priority_of(b"a").unwrap(), Some(0));
        assert_eq!(map.priority_of(b"b").unwrap(), Some(1));
        map.get(b"a").unwrap();
        assert_eq!(map.priority_of(b"a").unwrap(), Some(2));
        assert_eq!(map.current_priority(), 3);
    }
}
