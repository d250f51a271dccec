//! Byte heap collaborators.
//!
//! A table never stores keys or values inline: each entry is a blob in a
//! [`ByteHeap`] plus optional per-object metadata (eviction links or a
//! priority). The slot array only holds the offset returned by
//! [`ByteHeap::add_object`].
//!
//! Heaps are handed to maps as [`SharedHeap`] so several tables can live in
//! one heap. A map that shares its heap does not compact it on its own; the
//! owner coordinates `begin_remap` / `remap` / `end_remap` across all tables.
//!
//! ## Provided heaps
//!
//! - [`MemHeap`]: in-memory arena with stable handles as offsets
//! - [`LruMemHeap`]: a `MemHeap` that also tracks recency of use

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::error::{MapError, MapResult};
use crate::links::{LinkedList, Links};

/// A heap shared between one or more tables.
pub type SharedHeap<H> = Arc<Mutex<H>>;

/// Wrap a heap so it can be handed to one or more maps.
pub fn shared<H>(heap: H) -> SharedHeap<H> {
    Arc::new(Mutex::new(heap))
}

/// Default arena limit for heaps created with `Default`
pub const DEFAULT_HEAP_MEMORY: u64 = 64 * 1024 * 1024;

/// Object store addressed by integer offsets.
pub trait ByteHeap {
    /// Store `data` and optional `metadata`, returning the new offset.
    fn add_object(&mut self, data: &[u8], metadata: Option<&[u8]>) -> MapResult<u64>;

    fn retrieve_data(&self, offset: u64) -> MapResult<&[u8]>;

    /// Metadata of the object, None if it was stored without any.
    fn retrieve_metadata(&self, offset: u64) -> MapResult<Option<&[u8]>>;

    fn set_metadata(&mut self, offset: u64, metadata: &[u8]) -> MapResult<()>;

    fn remove_object(&mut self, offset: u64) -> MapResult<()>;

    /// Start a compaction pass. Every object not passed to [`ByteHeap::remap`]
    /// before [`ByteHeap::end_remap`] is dropped.
    fn begin_remap(&mut self);

    /// Mark `offset` as live during a compaction pass.
    fn remap(&mut self, offset: u64);

    fn end_remap(&mut self);

    /// Bytes in use as a percentage of the memory limit.
    fn usage_percent(&self) -> u32;

    fn set_max_memory(&mut self, bytes: u64);

    /// Drop every object.
    fn initialize(&mut self);

    /// Number of live objects.
    fn object_count(&self) -> usize;
}

/// A heap that remembers which object was used least recently.
pub trait LruHeap: ByteHeap {
    /// Least recently added or touched object.
    fn oldest(&self) -> Option<u64>;

    /// Mark `offset` as the most recently used object.
    fn set_as_new(&mut self, offset: u64) -> MapResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct ObjectRef {
    start: usize,
    data_len: usize,
    /// None when stored without metadata
    meta_len: Option<usize>,
}

impl ObjectRef {
    fn total_len(&self) -> usize {
        self.data_len + self.meta_len.unwrap_or(0)
    }
}

/// In-memory heap: an append-only arena compacted when it runs out of room.
///
/// Offsets are handles from a monotonically increasing counter, so they stay
/// valid across internal compaction.
#[derive(Debug)]
pub struct MemHeap {
    arena: Vec<u8>,
    objects: HashMap<u64, ObjectRef>,
    next_offset: u64,
    live_bytes: u64,
    max_memory: u64,
    /// Live set of an ongoing remap pass
    marked: Option<HashSet<u64>>,
}

impl Default for MemHeap {
    fn default() -> Self {
        Self::with_max_memory(DEFAULT_HEAP_MEMORY)
    }
}

impl MemHeap {
    pub fn with_max_memory(max_memory: u64) -> Self {
        Self {
            arena: Vec::new(),
            objects: HashMap::new(),
            next_offset: 0,
            live_bytes: 0,
            max_memory,
            marked: None,
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.objects.contains_key(&offset)
    }

    /// Bytes held by live objects.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Bytes held by the arena, garbage included.
    pub fn arena_bytes(&self) -> u64 {
        self.arena.len() as u64
    }

    fn object(&self, offset: u64) -> MapResult<ObjectRef> {
        self.objects.get(&offset).copied().ok_or(MapError::DanglingOffset(offset))
    }

    fn append(&mut self, data: &[u8], metadata: Option<&[u8]>) -> ObjectRef {
        let start = self.arena.len();
        self.arena.extend_from_slice(data);
        if let Some(meta) = metadata {
            self.arena.extend_from_slice(meta);
        }
        ObjectRef { start, data_len: data.len(), meta_len: metadata.map(<[u8]>::len) }
    }

    fn reserve(&mut self, needed: u64) -> MapResult<()> {
        if self.arena.len() as u64 + needed <= self.max_memory {
            return Ok(());
        }
        if (self.arena.len() as u64) > self.live_bytes {
            self.compact();
        }
        let used = self.arena.len() as u64;
        if used + needed > self.max_memory {
            return Err(MapError::HeapExhausted {
                requested: needed,
                available: self.max_memory.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Repack live objects to the front of a fresh arena.
    fn compact(&mut self) {
        let mut live: Vec<(u64, ObjectRef)> = self.objects.iter().map(|(&k, &v)| (k, v)).collect();
        live.sort_unstable_by_key(|(_, obj)| obj.start);

        let mut arena = Vec::with_capacity(self.live_bytes as usize);
        for (offset, obj) in live {
            let start = arena.len();
            arena.extend_from_slice(&self.arena[obj.start..obj.start + obj.total_len()]);
            if let Some(slot) = self.objects.get_mut(&offset) {
                slot.start = start;
            }
        }
        self.arena = arena;
    }
}

impl ByteHeap for MemHeap {
    fn add_object(&mut self, data: &[u8], metadata: Option<&[u8]>) -> MapResult<u64> {
        let needed = (data.len() + metadata.map_or(0, <[u8]>::len)) as u64;
        self.reserve(needed)?;
        let obj = self.append(data, metadata);
        let offset = self.next_offset;
        self.next_offset += 1;
        self.objects.insert(offset, obj);
        self.live_bytes += needed;
        Ok(offset)
    }

    fn retrieve_data(&self, offset: u64) -> MapResult<&[u8]> {
        let obj = self.object(offset)?;
        Ok(&self.arena[obj.start..obj.start + obj.data_len])
    }

    fn retrieve_metadata(&self, offset: u64) -> MapResult<Option<&[u8]>> {
        let obj = self.object(offset)?;
        Ok(obj.meta_len.map(|len| {
            let at = obj.start + obj.data_len;
            &self.arena[at..at + len]
        }))
    }

    fn set_metadata(&mut self, offset: u64, metadata: &[u8]) -> MapResult<()> {
        let obj = self.object(offset)?;
        if obj.meta_len == Some(metadata.len()) {
            let at = obj.start + obj.data_len;
            self.arena[at..at + metadata.len()].copy_from_slice(metadata);
            return Ok(());
        }
        // different size: relocate the object, the old copy becomes garbage
        let old_meta = obj.meta_len.unwrap_or(0) as u64;
        self.reserve(obj.data_len as u64 + metadata.len() as u64)?;
        // reserve may have compacted the arena
        let obj = self.object(offset)?;
        let data = self.arena[obj.start..obj.start + obj.data_len].to_vec();
        let moved = self.append(&data, Some(metadata));
        self.objects.insert(offset, moved);
        self.live_bytes = self.live_bytes - old_meta + metadata.len() as u64;
        Ok(())
    }

    fn remove_object(&mut self, offset: u64) -> MapResult<()> {
        let obj = self.objects.remove(&offset).ok_or(MapError::DanglingOffset(offset))?;
        self.live_bytes -= obj.total_len() as u64;
        if let Some(marked) = self.marked.as_mut() {
            marked.remove(&offset);
        }
        Ok(())
    }

    fn begin_remap(&mut self) {
        self.marked = Some(HashSet::new());
    }

    fn remap(&mut self, offset: u64) {
        if let Some(marked) = self.marked.as_mut() {
            marked.insert(offset);
        }
    }

    fn end_remap(&mut self) {
        let Some(marked) = self.marked.take() else {
            return;
        };
        let mut freed = 0u64;
        self.objects.retain(|offset, obj| {
            let keep = marked.contains(offset);
            if !keep {
                freed += obj.total_len() as u64;
            }
            keep
        });
        self.live_bytes -= freed;
        self.compact();
    }

    fn usage_percent(&self) -> u32 {
        ((self.arena.len() as u128 * 100) / self.max_memory.max(1) as u128) as u32
    }

    fn set_max_memory(&mut self, bytes: u64) {
        self.max_memory = bytes;
    }

    fn initialize(&mut self) {
        let max_memory = self.max_memory;
        *self = Self::with_max_memory(max_memory);
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// [`MemHeap`] with a recency list over its objects.
///
/// New objects enter at the young end; [`LruHeap::set_as_new`] moves an
/// object back there; [`LruHeap::oldest`] is the other end.
#[derive(Debug, Default)]
pub struct LruMemHeap {
    heap: MemHeap,
    recency: HashMap<u64, Links>,
    order: LinkedList,
}

impl LruMemHeap {
    pub fn with_max_memory(max_memory: u64) -> Self {
        Self { heap: MemHeap::with_max_memory(max_memory), ..Self::default() }
    }

    pub fn inner(&self) -> &MemHeap {
        &self.heap
    }
}

impl ByteHeap for LruMemHeap {
    fn add_object(&mut self, data: &[u8], metadata: Option<&[u8]>) -> MapResult<u64> {
        let offset = self.heap.add_object(data, metadata)?;
        self.order.push_back(&mut self.recency, offset)?;
        Ok(offset)
    }

    fn retrieve_data(&self, offset: u64) -> MapResult<&[u8]> {
        self.heap.retrieve_data(offset)
    }

    fn retrieve_metadata(&self, offset: u64) -> MapResult<Option<&[u8]>> {
        self.heap.retrieve_metadata(offset)
    }

    fn set_metadata(&mut self, offset: u64, metadata: &[u8]) -> MapResult<()> {
        self.heap.set_metadata(offset, metadata)
    }

    fn remove_object(&mut self, offset: u64) -> MapResult<()> {
        self.heap.remove_object(offset)?;
        self.order.unlink(&mut self.recency, offset)?;
        self.recency.remove(&offset);
        Ok(())
    }

    fn begin_remap(&mut self) {
        self.heap.begin_remap();
    }

    fn remap(&mut self, offset: u64) {
        self.heap.remap(offset);
    }

    fn end_remap(&mut self) {
        self.heap.end_remap();
        let dropped: Vec<u64> = self.recency.keys().copied()
            .filter(|ofs| !self.heap.contains(*ofs))
            .collect();
        for offset in dropped {
            // neighbours may be dropped too, so relink through the store
            if self.order.unlink(&mut self.recency, offset).is_ok() {
                self.recency.remove(&offset);
            }
        }
    }

    fn usage_percent(&self) -> u32 {
        self.heap.usage_percent()
    }

    fn set_max_memory(&mut self, bytes: u64) {
        self.heap.set_max_memory(bytes);
    }

    fn initialize(&mut self) {
        self.heap.initialize();
        self.recency.clear();
        self.order.clear();
    }

    fn object_count(&self) -> usize {
        self.heap.object_count()
    }
}

impl LruHeap for LruMemHeap {
    fn oldest(&self) -> Option<u64> {
        self.order.front()
    }

    fn set_as_new(&mut self, offset: u64) -> MapResult<()> {
        if !self.heap.contains(offset) {
            return Err(MapError::DanglingOffset(offset));
        }
        self.order.move_to_back(&mut self.recency, offset)
    }
}
