//! Bounded map with monotonic priorities and amortized sweeps.
//!
//! Every insert (and, with `move_accessed_to_top`, every read) stamps the
//! entry with the next value of a counter. Once the map grows past its
//! bound, `min_priority` is raised a little and a slice of the table is swept
//! for entries below it. Sweeps continue from where the previous one stopped,
//! so the cost of eviction is spread over many inserts.
//!
//! When the counter reaches `max_priority` every stored priority is rebased
//! so the lowest live one becomes 0.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::MapConfig;
use crate::error::{MapError, MapResult};
use crate::heap::ByteHeap;
use crate::storage::SlotStorage;
use crate::table::{RemovedEntry, TableCore};

use super::EvictionPolicy;

/// Priority metadata size
pub const PRIORITY_METADATA_LEN: usize = 4;

/// Heap usage above which a sweep that removed entries compacts the heap
const COMPACT_USAGE_PERCENT: u32 = 95;

/// Length of the persisted policy state
const STATE_LEN: usize = 16;

fn decode_priority(metadata: Option<&[u8]>) -> Option<u32> {
    match metadata {
        Some(m) if m.len() >= PRIORITY_METADATA_LEN => Some(u32::from_be_bytes([m[0], m[1], m[2], m[3]])),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Priority {
    max_elements: usize,
    max_priority: u32,
    divisor: usize,
    move_accessed_to_top: bool,
    /// Remove in full-table passes instead of amortized slices
    bulk_removal: bool,
    current_priority: u32,
    min_priority: u32,
    scan_cursor: usize,
}

impl Priority {
    /// `max_elements == 0` disables the bound and priority tracking.
    pub fn new(max_elements: usize) -> Self {
        Self::from_config(&MapConfig::cache(max_elements))
    }

    pub fn from_config(config: &MapConfig) -> Self {
        Self {
            max_elements: config.max_elements,
            max_priority: config.max_priority,
            divisor: config.eviction_divisor.max(2),
            move_accessed_to_top: config.move_accessed_to_top,
            bulk_removal: false,
            current_priority: 0,
            min_priority: 0,
            scan_cursor: 0,
        }
    }

    /// Sweep the whole table until the bound holds, instead of a slice per insert.
    pub fn with_bulk_removal(mut self, bulk: bool) -> Self {
        self.bulk_removal = bulk;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u32) -> Self {
        self.max_priority = max_priority.max(1);
        self
    }

    pub fn min_priority(&self) -> u32 {
        self.min_priority
    }

    /// Priority the next stamped entry receives.
    pub fn current_priority(&self) -> u32 {
        self.current_priority
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    fn enabled(&self) -> bool {
        self.max_elements > 0
    }

    fn next_priority(&mut self) -> u32 {
        let p = self.current_priority;
        self.current_priority = self.current_priority.saturating_add(1);
        p
    }

    /// Rebase every stored priority so the lowest live one (or `min_priority`
    /// if higher) becomes 0. The set of present keys is unchanged.
    pub fn reprioritize<H: ByteHeap, S: SlotStorage>(&mut self, core: &mut TableCore<H, S>) -> MapResult<()> {
        let heap = Arc::clone(core.heap());
        let mut heap = heap.lock();
        let offsets: Vec<u64> = (0..core.capacity()).filter_map(|i| core.offset_at(i)).collect();

        let mut lowest: Option<u32> = None;
        for &offset in &offsets {
            if let Some(p) = decode_priority(heap.retrieve_metadata(offset)?) {
                lowest = Some(lowest.map_or(p, |l| l.min(p)));
            }
        }
        let base = lowest.map_or(self.min_priority, |l| l.max(self.min_priority));
        if base == 0 {
            warn!(current = self.current_priority, "reprioritize found nothing to rebase");
        }
        for &offset in &offsets {
            if let Some(p) = decode_priority(heap.retrieve_metadata(offset)?) {
                heap.set_metadata(offset, &p.saturating_sub(base).to_be_bytes())?;
            }
        }
        let before = self.current_priority;
        self.current_priority = self.current_priority.saturating_sub(base);
        self.min_priority = 0;
        info!(base, before, after = self.current_priority, entries = offsets.len(), "priorities rebased");
        Ok(())
    }

    fn remove_low_priority<H: ByteHeap, S: SlotStorage>(&mut self, core: &mut TableCore<H, S>) -> MapResult<()> {
        if !self.bulk_removal {
            self.sweep_slice(core)?;
        }
        // size never stays above max_elements once an insert returns
        while core.len() > self.max_elements {
            self.bulk_pass(core)?;
        }
        Ok(())
    }

    /// Raise `min_priority` and sweep `capacity / divisor` slots from the
    /// persisted cursor, once the size passes the trigger point.
    fn sweep_slice<H: ByteHeap, S: SlotStorage>(&mut self, core: &mut TableCore<H, S>) -> MapResult<()> {
        let d = self.divisor;
        let target = self.max_elements * (d - 1) / d;
        let size = core.len();
        if size <= target * (d + 1) / d {
            return Ok(());
        }
        let step = ((size - target) / d).max(1);
        self.min_priority = self.min_priority.saturating_add(step as u32);

        let count = (core.capacity() / d).max(1);
        let min = self.min_priority;
        let from = self.scan_cursor;
        self.scan_cursor = core.sweep(
            from,
            count,
            false,
            |entry| Ok(decode_priority(entry.metadata).is_some_and(|p| p < min)),
            |_, _| Ok(()),
        )?;
        let removed = size - core.len();
        debug!(removed, min_priority = min, from, count, size = core.len(), "priority sweep");

        if removed > 0 && core.heap().lock().usage_percent() > COMPACT_USAGE_PERCENT {
            core.compress_heap()?;
        }
        Ok(())
    }

    /// One full pass raising `min_priority` by a fraction of the live range.
    fn bulk_pass<H: ByteHeap, S: SlotStorage>(&mut self, core: &mut TableCore<H, S>) -> MapResult<()> {
        let step = ((self.current_priority.saturating_sub(self.min_priority)) / self.divisor as u32).max(1);
        self.min_priority = self.min_priority.saturating_add(step);
        let min = self.min_priority;
        let remap = !core.heap_is_shared() && core.heap().lock().usage_percent() > COMPACT_USAGE_PERCENT;
        if remap {
            core.heap().lock().begin_remap();
        }
        let capacity = core.capacity();
        let swept = core.sweep(
            0,
            capacity,
            remap,
            |entry| Ok(decode_priority(entry.metadata).is_some_and(|p| p < min)),
            |_, _| Ok(()),
        );
        if remap {
            core.heap().lock().end_remap();
        }
        swept?;
        debug!(min_priority = min, size = core.len(), remap, "bulk priority pass");
        if min >= self.current_priority && core.len() > self.max_elements {
            return Err(MapError::InvalidConfig("priority sweep cannot reach the bound".into()));
        }
        Ok(())
    }
}

impl<H: ByteHeap, S: SlotStorage> EvictionPolicy<H, S> for Priority {
    fn new_metadata(&mut self) -> Option<Vec<u8>> {
        if !self.enabled() {
            return None;
        }
        Some(self.next_priority().to_be_bytes().to_vec())
    }

    fn after_insert(&mut self, core: &mut TableCore<H, S>, _offset: u64) -> MapResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        if self.current_priority >= self.max_priority {
            self.reprioritize(core)?;
        }
        self.remove_low_priority(core)
    }

    fn after_access(&mut self, core: &mut TableCore<H, S>, offset: u64) -> MapResult<()> {
        if !self.enabled() || !self.move_accessed_to_top {
            return Ok(());
        }
        let priority = self.next_priority();
        core.heap().lock().set_metadata(offset, &priority.to_be_bytes())?;
        if self.current_priority >= self.max_priority {
            self.reprioritize(core)?;
        }
        Ok(())
    }

    fn after_remove(&mut self, _core: &mut TableCore<H, S>, entry: &RemovedEntry) -> MapResult<()> {
        if decode_priority(entry.metadata.as_deref()) == Some(self.min_priority) {
            self.min_priority = self.min_priority.saturating_add(1);
        }
        Ok(())
    }

    fn on_clear(&mut self) {
        self.min_priority = 0;
        self.current_priority = 0;
        self.scan_cursor = 0;
    }

    fn state(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_LEN);
        buf.extend_from_slice(&self.current_priority.to_be_bytes());
        buf.extend_from_slice(&self.min_priority.to_be_bytes());
        buf.extend_from_slice(&(self.scan_cursor as u64).to_be_bytes());
        buf
    }

    fn restore(&mut self, state: &[u8]) -> MapResult<()> {
        if state.is_empty() {
            return Ok(());
        }
        if state.len() != STATE_LEN {
            return Err(MapError::InvalidConfig(format!(
                "priority state needs {} bytes, got {}", STATE_LEN, state.len()
            )));
        }
        let mut cursor = [0u8; 8];
        cursor.copy_from_slice(&state[8..16]);
        self.current_priority = u32::from_be_bytes([state[0], state[1], state[2], state[3]]);
        self.min_priority = u32::from_be_bytes([state[4], state[5], state[6], state[7]]);
        self.scan_cursor = u64::from_be_bytes(cursor) as usize;
        Ok(())
    }
}
