//! Open-addressing table core.
//!
//! The table is a power-of-two array of slots probed linearly from
//! `hash(key) & mask`. Each occupied slot encodes a heap offset plus a state
//! tag (see [`crate::codec`]); the heap blob behind it holds one of:
//!
//! - `Value`: the value, the key is computed from it (or, when the map stores
//!   keys, `key ++ value`)
//! - `Null`: the key, mapped to a null value
//! - `Big`: `key ++ value`
//!
//! Stored keys are prefixed with a 4-byte big-endian length unless the key
//! relation has a fixed key size.
//!
//! ## Deletion
//!
//! There are no tombstones. Removing slot `j` scans forward and moves back
//! every entry whose natural bucket does not lie cyclically in `(j, i]`,
//! until an empty slot ends the cluster. Every key therefore stays reachable
//! from its natural bucket without crossing an empty slot.
//!
//! ## Invariants
//!
//! - `size` equals the number of non-empty slots
//! - after every public operation at least one slot is empty
//! - `mod_count` changes on every structural modification

use std::borrow::Cow;
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{Slot, SlotCodec, EMPTY_SLOT};
use crate::config::{table_size_for, CreationFlags, MapConfig, SlotWidth, MAXIMUM_CAPACITY};
use crate::error::{MapError, MapResult};
use crate::heap::{ByteHeap, SharedHeap};
use crate::keys::KeyRelation;
use crate::storage::SlotStorage;

/// Length prefix of a stored variable-length key
const KEY_LEN_PREFIX: usize = 4;

/// How blobs are laid out, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    store_keys: bool,
    big_values: bool,
    /// Fixed stored key length; None means length-prefixed keys
    key_size: Option<usize>,
    big_value_threshold: usize,
}

impl Layout {
    fn stores_key(&self, slot: Slot) -> bool {
        match slot {
            Slot::Big(_) => true,
            Slot::Value(_) => self.store_keys,
            _ => false,
        }
    }

    fn split<'b>(&self, offset: u64, blob: &'b [u8]) -> MapResult<(&'b [u8], &'b [u8])> {
        let corrupt = |reason: &str| MapError::CorruptEntry { offset, reason: reason.to_string() };
        match self.key_size {
            Some(n) if blob.len() >= n => Ok(blob.split_at(n)),
            Some(_) => Err(corrupt("blob shorter than the fixed key size")),
            None => {
                if blob.len() < KEY_LEN_PREFIX {
                    return Err(corrupt("missing key length prefix"));
                }
                let len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
                let rest = &blob[KEY_LEN_PREFIX..];
                if rest.len() < len {
                    return Err(corrupt("key length exceeds blob"));
                }
                Ok(rest.split_at(len))
            }
        }
    }

    fn key_of<'b>(&self, keys: &dyn KeyRelation, slot: Slot, blob: &'b [u8])
        -> MapResult<Cow<'b, [u8]>>
    {
        match slot {
            Slot::Empty => Err(MapError::CorruptEntry { offset: 0, reason: "empty slot".into() }),
            Slot::Null(_) => Ok(Cow::Borrowed(blob)),
            s if self.stores_key(s) => {
                let offset = s.offset().unwrap_or_default();
                Ok(Cow::Borrowed(self.split(offset, blob)?.0))
            }
            _ => keys.compute_key(blob).map(Cow::Owned).ok_or(MapError::KeyNotDerivable),
        }
    }

    fn value_of<'b>(&self, slot: Slot, blob: &'b [u8]) -> MapResult<Option<&'b [u8]>> {
        match slot {
            Slot::Empty | Slot::Null(_) => Ok(None),
            s if self.stores_key(s) => {
                let offset = s.offset().unwrap_or_default();
                Ok(Some(self.split(offset, blob)?.1))
            }
            _ => Ok(Some(blob)),
        }
    }

    fn join(&self, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(KEY_LEN_PREFIX + key.len() + value.len());
        if self.key_size.is_none() {
            blob.extend_from_slice(&(key.len() as u32).to_be_bytes());
        }
        blob.extend_from_slice(key);
        blob.extend_from_slice(value);
        blob
    }

    /// Blob to store and the slot constructor for it.
    fn encode_entry<'a>(&self, key: &'a [u8], value: Option<&'a [u8]>)
        -> (Cow<'a, [u8]>, fn(u64) -> Slot)
    {
        let value_slot: fn(u64) -> Slot = Slot::Value;
        match value {
            None => (Cow::Borrowed(key), Slot::Null as fn(u64) -> Slot),
            Some(v) if self.store_keys => (Cow::Owned(self.join(key, v)), value_slot),
            Some(v) if self.big_values && v.len() > self.big_value_threshold => {
                (Cow::Owned(self.join(key, v)), Slot::Big as fn(u64) -> Slot)
            }
            Some(v) => (Cow::Borrowed(v), value_slot),
        }
    }
}

/// Borrowed view of one live entry, handed to sweep predicates.
pub struct EntryRef<'a> {
    pub offset: u64,
    pub slot: Slot,
    pub blob: &'a [u8],
    pub metadata: Option<&'a [u8]>,
    layout: &'a Layout,
    keys: &'a dyn KeyRelation,
}

impl<'a> EntryRef<'a> {
    pub fn key(&self) -> MapResult<Cow<'a, [u8]>> {
        self.layout.key_of(self.keys, self.slot, self.blob)
    }

    /// The value, None for a key mapped to null.
    pub fn value(&self) -> MapResult<Option<&'a [u8]>> {
        self.layout.value_of(self.slot, self.blob)
    }
}

/// An entry taken out of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub slot: Slot,
    /// Heap offset the entry had; the object is already gone
    pub offset: u64,
    pub metadata: Option<Vec<u8>>,
    /// Previous value when it was captured (`None` also for null values)
    pub value: Option<Vec<u8>>,
}

/// Result of a structural put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new key was stored at `offset`
    Inserted { offset: u64 },
    /// The key's entry was rewritten at `offset`
    Replaced { offset: u64, old: RemovedEntry, previous: Option<Vec<u8>> },
    /// The key was present and left alone
    Unchanged { offset: u64, previous: Option<Vec<u8>> },
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub index: usize,
    pub offset: u64,
    /// None when the key maps to null
    pub value: Option<Vec<u8>>,
}

/// Resumable traversal position, see [`TableCore::next_entry`].
#[derive(Debug, Clone)]
pub struct ScanCursor {
    next_index: usize,
    mod_count: u64,
}

/// One entry produced by a traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Diagnostic dump of one occupied slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableItem {
    /// Natural bucket of the key
    pub bucket: usize,
    /// Slot the entry actually sits in
    pub index: usize,
    pub offset: u64,
    pub hash: u32,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
}

/// Lookup counters and table geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub capacity: usize,
    pub size: usize,
    pub threshold: usize,
    /// Key lookups performed
    pub lookups: u64,
    /// Slots inspected by those lookups
    pub slot_checks: u64,
}

/// The table proper: slots, heap handle and bookkeeping. Eviction policies
/// receive `&mut TableCore` in their hooks.
pub struct TableCore<H: ByteHeap, S: SlotStorage> {
    pub(crate) slots: Option<S>,
    heap: SharedHeap<H>,
    heap_shared: bool,
    keys: Arc<dyn KeyRelation>,
    codec: SlotCodec,
    layout: Layout,
    pub(crate) flags: CreationFlags,
    pub(crate) slot_width: SlotWidth,
    pub(crate) page_size: usize,
    load_factor: f32,
    initial_capacity: usize,
    pub(crate) size: usize,
    pub(crate) threshold: usize,
    pub(crate) mod_count: u64,
    lookups: Cell<u64>,
    slot_checks: Cell<u64>,
    pub(crate) path: Option<PathBuf>,
    /// Slot array reallocated since the last load/save
    pub(crate) resized: bool,
    /// Slot array mirrors a file on disk
    pub(crate) loaded: bool,
}

impl<H: ByteHeap, S: SlotStorage> TableCore<H, S> {
    pub fn new(config: &MapConfig, keys: Arc<dyn KeyRelation>, heap: SharedHeap<H>, heap_shared: bool)
        -> MapResult<Self>
    {
        config.validate()?;
        let mut flags = config.flags;
        if !keys.derives_keys() && !flags.store_keys {
            debug!("key relation cannot derive keys, storing keys with values");
            flags.store_keys = true;
        }
        let key_size = if flags.variable_length_keys { None } else { keys.key_size() };
        let layout = Layout {
            store_keys: flags.store_keys,
            big_values: flags.support_big_values,
            key_size,
            big_value_threshold: config.big_value_threshold,
        };
        if !heap_shared {
            heap.lock().set_max_memory(config.heap_max_memory);
        }
        Ok(Self {
            slots: None,
            heap,
            heap_shared,
            keys,
            codec: SlotCodec::new(config.slot_width, &flags),
            layout,
            flags,
            slot_width: config.slot_width,
            page_size: config.page_size,
            load_factor: config.load_factor,
            initial_capacity: table_size_for(config.initial_capacity),
            size: 0,
            threshold: 0,
            mod_count: 0,
            lookups: Cell::new(0),
            slot_checks: Cell::new(0),
            path: None,
            resized: false,
            loaded: false,
        })
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Allocated slot count, 0 before the first insert.
    pub fn capacity(&self) -> usize {
        self.slots.as_ref().map_or(0, S::len)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    pub fn flags(&self) -> &CreationFlags {
        &self.flags
    }

    pub fn heap(&self) -> &SharedHeap<H> {
        &self.heap
    }

    pub fn heap_is_shared(&self) -> bool {
        self.heap_shared
    }

    pub fn key_relation(&self) -> &Arc<dyn KeyRelation> {
        &self.keys
    }

    /// Heap offset stored in slot `index`, None if the slot is empty.
    pub fn offset_at(&self, index: usize) -> Option<u64> {
        self.slots.as_ref().and_then(|s| self.codec.decode(s.get(index)).offset())
    }

    fn slot_at(&self, index: usize) -> Slot {
        self.slots.as_ref().map_or(Slot::Empty, |s| self.codec.decode(s.get(index)))
    }

    pub(crate) fn threshold_for(&self, capacity: usize) -> usize {
        ((capacity as f64 * self.load_factor as f64) as usize).min(capacity.saturating_sub(1))
    }

    fn check_key(&self, key: &[u8]) -> MapResult<()> {
        match self.layout.key_size {
            Some(expected) if key.len() != expected => {
                Err(MapError::InvalidKeyLength { expected, actual: key.len() })
            }
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    /// Probe for `key`; returns the slot index and decoded slot.
    pub(crate) fn find(&self, key: &[u8]) -> MapResult<Option<(usize, Slot)>> {
        self.lookups.set(self.lookups.get() + 1);
        let Some(slots) = self.slots.as_ref() else {
            return Ok(None);
        };
        let mask = slots.len() - 1;
        let mut index = self.keys.hash(key) as usize & mask;
        let heap = self.heap.lock();
        loop {
            self.slot_checks.set(self.slot_checks.get() + 1);
            let slot = self.codec.decode(slots.get(index));
            let Some(offset) = slot.offset() else {
                return Ok(None);
            };
            let blob = heap.retrieve_data(offset)?;
            if self.layout.key_of(&*self.keys, slot, blob)?.as_ref() == key {
                return Ok(Some((index, slot)));
            }
            index = (index + 1) & mask;
        }
    }

    pub fn lookup(&self, key: &[u8]) -> MapResult<Option<Lookup>> {
        let Some((index, slot)) = self.find(key)? else {
            return Ok(None);
        };
        let offset = slot.offset().unwrap_or_default();
        let heap = self.heap.lock();
        let value = self.layout.value_of(slot, heap.retrieve_data(offset)?)?.map(<[u8]>::to_vec);
        Ok(Some(Lookup { index, offset, value }))
    }

    pub fn contains_key(&self, key: &[u8]) -> MapResult<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Linear scan for an entry whose value equals `value`.
    pub fn contains_value(&self, value: &[u8]) -> MapResult<bool> {
        let Some(slots) = self.slots.as_ref() else {
            return Ok(false);
        };
        let heap = self.heap.lock();
        for index in 0..slots.len() {
            let slot = self.codec.decode(slots.get(index));
            if let Some(offset) = slot.offset() {
                if self.layout.value_of(slot, heap.retrieve_data(offset)?)? == Some(value) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Metadata attached to the entry of `key`.
    pub fn metadata_of(&self, key: &[u8]) -> MapResult<Option<Vec<u8>>> {
        let Some((_, slot)) = self.find(key)? else {
            return Ok(None);
        };
        let offset = slot.offset().unwrap_or_default();
        let heap = self.heap.lock();
        Ok(heap.retrieve_metadata(offset)?.map(<[u8]>::to_vec))
    }

    /// Key of the entry stored at `offset`.
    pub fn key_at_offset(&self, offset: u64, slot: Slot) -> MapResult<Vec<u8>> {
        let heap = self.heap.lock();
        Ok(self.layout.key_of(&*self.keys, slot, heap.retrieve_data(offset)?)?.into_owned())
    }

    // ---------------------------------------------------------------
    // Insert
    // ---------------------------------------------------------------

    /// Store `key -> value` (None = null). An existing key is rewritten only
    /// when `overwrite` is set. `new_metadata` is called once per stored blob.
    ///
    /// The table grows before returning when `size` passes the threshold.
    pub fn put_val(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        overwrite: bool,
        new_metadata: &mut dyn FnMut() -> Option<Vec<u8>>,
    ) -> MapResult<PutOutcome> {
        if value.is_none() && !self.flags.support_null_values {
            return Err(MapError::CapabilityDisabled { capability: "support_null_values" });
        }
        self.check_key(key)?;
        if self.slots.is_none() {
            self.resize()?;
        }

        let mask = self.capacity() - 1;
        let mut index = self.keys.hash(key) as usize & mask;
        loop {
            let slot = self.slot_at(index);
            let Some(offset) = slot.offset() else {
                break;
            };
            let (same, previous) = {
                let heap = self.heap.lock();
                let blob = heap.retrieve_data(offset)?;
                let same = self.same_entry(slot, blob, key, value)?;
                let previous = if same {
                    self.layout.value_of(slot, blob)?.map(<[u8]>::to_vec)
                } else {
                    None
                };
                (same, previous)
            };
            if !same {
                index = (index + 1) & mask;
                continue;
            }
            if !overwrite || (slot.is_null() && value.is_none()) {
                return Ok(PutOutcome::Unchanged { offset, previous });
            }
            let metadata = {
                let heap = self.heap.lock();
                heap.retrieve_metadata(offset)?.map(<[u8]>::to_vec)
            };
            let new_offset = self.store_at(index, key, value, new_metadata())?;
            self.heap.lock().remove_object(offset)?;
            let old = RemovedEntry { slot, offset, metadata, value: previous.clone() };
            return Ok(PutOutcome::Replaced { offset: new_offset, old, previous });
        }

        if self.size + 1 >= MAXIMUM_CAPACITY && self.capacity() == MAXIMUM_CAPACITY {
            return Err(MapError::InvalidCapacity { requested: self.size + 1, max: MAXIMUM_CAPACITY });
        }
        let offset = self.store_at(index, key, value, new_metadata())?;
        self.size += 1;
        self.mod_count += 1;
        if self.size > self.threshold {
            self.resize()?;
        }
        Ok(PutOutcome::Inserted { offset })
    }

    /// Does the entry in `slot` belong to `key`? A value entry whose bytes
    /// equal the incoming value is the same entry without computing a key.
    fn same_entry(&self, slot: Slot, blob: &[u8], key: &[u8], value: Option<&[u8]>) -> MapResult<bool> {
        if let (Some(v), Slot::Value(_)) = (value, slot) {
            if !self.layout.store_keys && blob == v {
                return Ok(true);
            }
        }
        Ok(self.layout.key_of(&*self.keys, slot, blob)?.as_ref() == key)
    }

    fn store_at(&mut self, index: usize, key: &[u8], value: Option<&[u8]>, metadata: Option<Vec<u8>>)
        -> MapResult<u64>
    {
        let (blob, make_slot) = self.layout.encode_entry(key, value);
        let mut heap = self.heap.lock();
        let offset = heap.add_object(&blob, metadata.as_deref())?;
        let raw = match self.codec.encode(make_slot(offset)) {
            Ok(raw) => raw,
            Err(e) => {
                heap.remove_object(offset)?;
                return Err(e);
            }
        };
        if let Some(slots) = self.slots.as_mut() {
            slots.set(index, raw);
        }
        Ok(offset)
    }

    // ---------------------------------------------------------------
    // Resize
    // ---------------------------------------------------------------

    /// Allocate the initial array, or double it and rehash every entry.
    pub(crate) fn resize(&mut self) -> MapResult<()> {
        let old_capacity = self.capacity();
        if old_capacity >= MAXIMUM_CAPACITY {
            self.threshold = MAXIMUM_CAPACITY - 1;
            return Ok(());
        }
        let new_capacity = if old_capacity == 0 { self.initial_capacity } else { old_capacity * 2 };
        let mut fresh = S::allocate(new_capacity, self.slot_width, self.page_size,
                                    self.flags.align_slots_in_pages);
        if let Some(old) = self.slots.as_ref() {
            let mask = new_capacity - 1;
            let heap = self.heap.lock();
            for j in 0..old.len() {
                let raw = old.get(j);
                if raw == EMPTY_SLOT {
                    continue;
                }
                let slot = self.codec.decode(raw);
                let offset = slot.offset().unwrap_or_default();
                let key = self.layout.key_of(&*self.keys, slot, heap.retrieve_data(offset)?)?;
                let mut index = self.keys.hash(&key) as usize & mask;
                while fresh.get(index) != EMPTY_SLOT {
                    index = (index + 1) & mask;
                }
                fresh.set(index, raw);
            }
        }
        self.slots = Some(fresh);
        self.threshold = self.threshold_for(new_capacity);
        self.resized = true;
        self.mod_count += 1;
        if old_capacity > 0 {
            info!(from = old_capacity, to = new_capacity, size = self.size, "table resized");
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Removal
    // ---------------------------------------------------------------

    /// Remove `key`, capturing its value.
    pub fn remove_node(&mut self, key: &[u8]) -> MapResult<Option<RemovedEntry>> {
        let Some((index, _)) = self.find(key)? else {
            return Ok(None);
        };
        let (entry, _) = self.remove_at(index, index, true)?;
        Ok(Some(entry))
    }

    /// Empty slot `index`, free its heap object and close the gap.
    ///
    /// Returns the removed entry and whether the entry that now occupies
    /// `index` was picked up at or past `boundary`.
    pub fn remove_at(&mut self, index: usize, boundary: usize, capture_value: bool)
        -> MapResult<(RemovedEntry, bool)>
    {
        let slot = self.slot_at(index);
        let offset = slot.offset().ok_or_else(|| MapError::CorruptEntry {
            offset: index as u64,
            reason: "removing an empty slot".into(),
        })?;
        let (metadata, value) = {
            let mut heap = self.heap.lock();
            let metadata = heap.retrieve_metadata(offset)?.map(<[u8]>::to_vec);
            let value = if capture_value {
                self.layout.value_of(slot, heap.retrieve_data(offset)?)?.map(<[u8]>::to_vec)
            } else {
                None
            };
            heap.remove_object(offset)?;
            (metadata, value)
        };
        self.size -= 1;
        self.mod_count += 1;
        let crossed = self.fill_gap(index, boundary)?;
        Ok((RemovedEntry { slot, offset, metadata, value }, crossed))
    }

    /// Close the hole at `hole` by moving later cluster members back.
    /// Returns true if the entry moved into the original hole came from at
    /// or past `boundary`.
    fn fill_gap(&mut self, mut hole: usize, boundary: usize) -> MapResult<bool> {
        let Some(slots) = self.slots.as_mut() else {
            return Ok(false);
        };
        let mask = slots.len() - 1;
        let boundary = boundary & mask;
        let heap = self.heap.lock();
        slots.set(hole, EMPTY_SLOT);

        let start = hole;
        let mut filler_crossed = false;
        let mut crossed = false;
        let mut i = hole;
        loop {
            i = (i + 1) & mask;
            if i == boundary {
                crossed = true;
            }
            let raw = slots.get(i);
            if raw == EMPTY_SLOT {
                slots.set(hole, EMPTY_SLOT);
                return Ok(filler_crossed);
            }
            let slot = self.codec.decode(raw);
            let offset = slot.offset().unwrap_or_default();
            let key = self.layout.key_of(&*self.keys, slot, heap.retrieve_data(offset)?)?;
            let natural = self.keys.hash(&key) as usize & mask;
            // movable unless the natural bucket lies cyclically in (hole, i]
            if (i.wrapping_sub(natural) & mask) >= (i.wrapping_sub(hole) & mask) {
                slots.set(hole, raw);
                if hole == start {
                    filler_crossed = crossed;
                }
                hole = i;
            }
        }
    }

    /// Remove the entry stored at heap offset `offset`, if it is in this table.
    pub fn remove_offset(&mut self, offset: u64) -> MapResult<Option<RemovedEntry>> {
        match self.locate_offset(offset)? {
            Some(index) => Ok(Some(self.remove_at(index, index, false)?.0)),
            None => Ok(None),
        }
    }

    /// Find the slot referencing `offset` by recomputing the key of the blob
    /// under every layout the flags allow and probing for that exact offset.
    pub fn locate_offset(&self, offset: u64) -> MapResult<Option<usize>> {
        let Some(slots) = self.slots.as_ref() else {
            return Ok(None);
        };
        let mask = slots.len() - 1;
        let heap = self.heap.lock();
        let blob = match heap.retrieve_data(offset) {
            Ok(blob) => blob,
            Err(MapError::DanglingOffset(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut candidates: Vec<Cow<'_, [u8]>> = Vec::with_capacity(3);
        if !self.layout.store_keys {
            if let Some(key) = self.keys.compute_key(blob) {
                candidates.push(Cow::Owned(key));
            }
        }
        if self.flags.support_null_values {
            candidates.push(Cow::Borrowed(blob));
        }
        if self.layout.store_keys || self.layout.big_values {
            if let Ok((key, _)) = self.layout.split(offset, blob) {
                candidates.push(Cow::Borrowed(key));
            }
        }

        for key in candidates {
            let mut index = self.keys.hash(&key) as usize & mask;
            loop {
                let slot = self.codec.decode(slots.get(index));
                match slot.offset() {
                    None => break,
                    Some(found) if found == offset => return Ok(Some(index)),
                    Some(_) => index = (index + 1) & mask,
                }
            }
        }
        Ok(None)
    }

    /// Visit `count` slots starting at `from`, removing entries for which
    /// `remove` returns true. `on_removed` runs right after each removal.
    /// With `remap` set, surviving entries are passed to [`ByteHeap::remap`].
    ///
    /// A removal can pull an unvisited entry back into the current slot, so
    /// that slot is examined again unless the entry now in it came from past
    /// the end of the range. Returns the slot after the last one visited.
    pub fn sweep<F, R>(&mut self, from: usize, count: usize, remap: bool, mut remove: F, mut on_removed: R)
        -> MapResult<usize>
    where
        F: FnMut(&EntryRef<'_>) -> MapResult<bool>,
        R: FnMut(&mut Self, RemovedEntry) -> MapResult<()>,
    {
        let capacity = self.capacity();
        if capacity == 0 {
            return Ok(from);
        }
        let mask = capacity - 1;
        let boundary = from.wrapping_add(count) & mask;
        let mut j = from & mask;
        let mut visited = 0;
        while visited < count {
            let slot = self.slot_at(j);
            if let Some(offset) = slot.offset() {
                let doomed = {
                    let mut heap = self.heap.lock();
                    let doomed = {
                        let entry = EntryRef {
                            offset,
                            slot,
                            blob: heap.retrieve_data(offset)?,
                            metadata: heap.retrieve_metadata(offset)?,
                            layout: &self.layout,
                            keys: &*self.keys,
                        };
                        remove(&entry)?
                    };
                    if !doomed && remap {
                        heap.remap(offset);
                    }
                    doomed
                };
                if doomed {
                    let (entry, crossed) = self.remove_at(j, boundary, false)?;
                    on_removed(self, entry)?;
                    if !self.slot_at(j).is_empty() && !crossed {
                        continue;
                    }
                }
            }
            j = (j + 1) & mask;
            visited += 1;
        }
        Ok(j)
    }

    /// Empty the table, freeing every heap object it references.
    pub fn clear(&mut self) -> MapResult<()> {
        self.mod_count += 1;
        let Some(slots) = self.slots.as_mut() else {
            return Ok(());
        };
        {
            let mut heap = self.heap.lock();
            for index in 0..slots.len() {
                if let Some(offset) = self.codec.decode(slots.get(index)).offset() {
                    heap.remove_object(offset)?;
                }
            }
        }
        slots.fill(EMPTY_SLOT);
        self.size = 0;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------

    pub(crate) fn entry_at(&self, index: usize) -> MapResult<Option<MapEntry>> {
        let slot = self.slot_at(index);
        let Some(offset) = slot.offset() else {
            return Ok(None);
        };
        let heap = self.heap.lock();
        let blob = heap.retrieve_data(offset)?;
        Ok(Some(MapEntry {
            key: self.layout.key_of(&*self.keys, slot, blob)?.into_owned(),
            value: self.layout.value_of(slot, blob)?.map(<[u8]>::to_vec),
        }))
    }

    fn check_unmodified(&self, expected: u64) -> MapResult<()> {
        if self.mod_count != expected {
            return Err(MapError::ConcurrentModification { expected, found: self.mod_count });
        }
        Ok(())
    }

    /// Call `f` for every entry in slot order.
    pub fn for_each<F>(&self, mut f: F) -> MapResult<()>
    where
        F: FnMut(&[u8], Option<&[u8]>),
    {
        let expected = self.mod_count;
        for index in 0..self.capacity() {
            if let Some(entry) = self.entry_at(index)? {
                f(&entry.key, entry.value.as_deref());
            }
        }
        self.check_unmodified(expected)
    }

    pub fn keys(&self) -> MapResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.size);
        self.for_each(|k, _| out.push(k.to_vec()))?;
        Ok(out)
    }

    pub fn values(&self) -> MapResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(self.size);
        self.for_each(|_, v| out.push(v.map(<[u8]>::to_vec)))?;
        Ok(out)
    }

    pub fn cursor(&self) -> ScanCursor {
        ScanCursor { next_index: 0, mod_count: self.mod_count }
    }

    /// Next entry after `cursor`, failing if the table changed since the
    /// cursor was created.
    pub fn next_entry(&self, cursor: &mut ScanCursor) -> MapResult<Option<MapEntry>> {
        self.check_unmodified(cursor.mod_count)?;
        while cursor.next_index < self.capacity() {
            let index = cursor.next_index;
            cursor.next_index += 1;
            if let Some(entry) = self.entry_at(index)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    // ---------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------

    /// Non-empty slots, counted directly.
    pub fn count_elements(&self) -> usize {
        (0..self.capacity()).filter(|&i| !self.slot_at(i).is_empty()).count()
    }

    /// Longest run of consecutive occupied slots (not wrapping).
    pub fn longest_filled_run(&self) -> usize {
        let mut longest = 0;
        let mut run = 0;
        for i in 0..self.capacity() {
            if self.slot_at(i).is_empty() {
                run = 0;
            } else {
                run += 1;
                longest = longest.max(run);
            }
        }
        longest
    }

    /// Mean probe length to reach each entry from its natural bucket.
    pub fn average_filled_run(&self) -> MapResult<f64> {
        let items = self.table_items()?;
        if items.is_empty() {
            return Ok(0.0);
        }
        let mask = self.capacity() - 1;
        let total: usize = items.iter()
            .map(|item| (item.index.wrapping_sub(item.bucket) & mask) + 1)
            .sum();
        Ok(total as f64 / items.len() as f64)
    }

    pub fn table_items(&self) -> MapResult<Vec<TableItem>> {
        let expected = self.mod_count;
        let mask = self.capacity().wrapping_sub(1);
        let mut items = Vec::with_capacity(self.size);
        let heap = self.heap.lock();
        for index in 0..self.capacity() {
            let slot = self.slot_at(index);
            let Some(offset) = slot.offset() else {
                continue;
            };
            let blob = heap.retrieve_data(offset)?;
            let key = self.layout.key_of(&*self.keys, slot, blob)?.into_owned();
            let hash = self.keys.hash(&key);
            items.push(TableItem {
                bucket: hash as usize & mask,
                index,
                offset,
                hash,
                value: self.layout.value_of(slot, blob)?.map(<[u8]>::to_vec),
                metadata: heap.retrieve_metadata(offset)?.map(<[u8]>::to_vec),
                key,
            });
        }
        drop(heap);
        self.check_unmodified(expected)?;
        Ok(items)
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            capacity: self.capacity(),
            size: self.size,
            threshold: self.threshold,
            lookups: self.lookups.get(),
            slot_checks: self.slot_checks.get(),
        }
    }

    // ---------------------------------------------------------------
    // Heap maintenance
    // ---------------------------------------------------------------

    /// Pass every live offset to `heap.remap`. Used by whoever coordinates
    /// compaction of a heap shared by several tables.
    pub fn mark_live_offsets(&self, heap: &mut H) {
        for index in 0..self.capacity() {
            if let Some(offset) = self.offset_at(index) {
                heap.remap(offset);
            }
        }
    }

    /// Compact an owned heap down to this table's live entries.
    pub fn compress_heap(&mut self) -> MapResult<()> {
        if self.heap_shared {
            warn!("heap is shared, skipping compaction; compact through the heap owner");
            return Ok(());
        }
        let heap_handle = Arc::clone(&self.heap);
        let mut heap = heap_handle.lock();
        let before = heap.usage_percent();
        heap.begin_remap();
        self.mark_live_offsets(&mut heap);
        heap.end_remap();
        info!(before, after = heap.usage_percent(), entries = self.size, "heap compacted");
        Ok(())
    }
}
