//! Bounded LRU. Recency lives in the heap; the policy only asks for the
//! oldest object and refreshes objects on access.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::MapResult;
use crate::heap::LruHeap;
use crate::storage::SlotStorage;
use crate::table::TableCore;

use super::EvictionPolicy;

#[derive(Debug, Clone, Copy)]
pub struct Lru {
    max_elements: usize,
}

impl Lru {
    /// `max_elements == 0` disables the bound.
    pub fn new(max_elements: usize) -> Self {
        Self { max_elements }
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }
}

impl<H: LruHeap, S: SlotStorage> EvictionPolicy<H, S> for Lru {
    fn after_insert(&mut self, core: &mut TableCore<H, S>, _offset: u64) -> MapResult<()> {
        if self.max_elements == 0 {
            return Ok(());
        }
        let mut evicted = 0;
        while core.len() > self.max_elements {
            let oldest = core.heap().lock().oldest();
            let Some(oldest) = oldest else {
                break;
            };
            if core.remove_offset(oldest)?.is_none() {
                warn!(offset = oldest, "oldest heap object belongs to another table, bound not enforced");
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, size = core.len(), "lru eviction");
        }
        Ok(())
    }

    fn after_access(&mut self, core: &mut TableCore<H, S>, offset: u64) -> MapResult<()> {
        let heap = Arc::clone(core.heap());
        let mut heap = heap.lock();
        heap.set_as_new(offset)
    }
}
