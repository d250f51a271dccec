//! Bounded FIFO: a doubly-linked list threaded through heap metadata.

use std::sync::Arc;

use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::heap::ByteHeap;
use crate::links::{LinkStore, LinkedList, Links, LINKS_METADATA_LEN};
use crate::storage::SlotStorage;
use crate::table::{RemovedEntry, TableCore};

use super::EvictionPolicy;

/// Links kept in the metadata of heap objects.
struct MetadataLinks<'a, H: ByteHeap>(&'a mut H);

impl<H: ByteHeap> LinkStore for MetadataLinks<'_, H> {
    fn links(&self, node: u64) -> MapResult<Links> {
        Ok(Links::from_metadata(self.0.retrieve_metadata(node)?))
    }

    fn set_links(&mut self, node: u64, links: Links) -> MapResult<()> {
        self.0.set_metadata(node, &links.to_metadata()?)
    }
}

/// Evicts the oldest inserted key once the map holds more than
/// `max_elements` keys. Reads do not change the order.
#[derive(Debug, Clone)]
pub struct Fifo {
    max_elements: usize,
    order: LinkedList,
}

impl Fifo {
    /// `max_elements == 0` disables the bound.
    pub fn new(max_elements: usize) -> Self {
        Self { max_elements, order: LinkedList::new() }
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Heap offset of the next victim.
    pub fn oldest(&self) -> Option<u64> {
        self.order.front()
    }

    pub fn tracked(&self) -> usize {
        self.order.len()
    }
}

impl<H: ByteHeap, S: SlotStorage> EvictionPolicy<H, S> for Fifo {
    fn new_metadata(&mut self) -> Option<Vec<u8>> {
        (self.max_elements > 0).then(|| vec![0u8; LINKS_METADATA_LEN])
    }

    fn after_insert(&mut self, core: &mut TableCore<H, S>, offset: u64) -> MapResult<()> {
        if self.max_elements == 0 {
            return Ok(());
        }
        {
            let heap = Arc::clone(core.heap());
            let mut heap = heap.lock();
            self.order.push_back(&mut MetadataLinks(&mut *heap), offset)?;
        }
        let mut evicted = 0;
        while core.len() > self.max_elements {
            let Some(oldest) = self.order.front() else {
                break;
            };
            let entry = core.remove_offset(oldest)?.ok_or(MapError::CorruptEntry {
                offset: oldest,
                reason: "FIFO head is not in the table".into(),
            })?;
            <Self as EvictionPolicy<H, S>>::after_remove(self, core, &entry)?;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, size = core.len(), "fifo eviction");
        }
        Ok(())
    }

    fn after_remove(&mut self, core: &mut TableCore<H, S>, entry: &RemovedEntry) -> MapResult<()> {
        if self.max_elements == 0 {
            return Ok(());
        }
        let links = Links::from_metadata(entry.metadata.as_deref());
        let heap = Arc::clone(core.heap());
        let mut heap = heap.lock();
        self.order.unlink_with(&mut MetadataLinks(&mut *heap), entry.offset, links)
    }

    fn on_clear(&mut self) {
        self.order.clear();
    }

    fn state(&self) -> Vec<u8> {
        self.order.to_bytes()
    }

    fn restore(&mut self, state: &[u8]) -> MapResult<()> {
        if !state.is_empty() {
            self.order = LinkedList::from_bytes(state)?;
        }
        Ok(())
    }
}
