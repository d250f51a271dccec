//! Eviction policies.
//!
//! A policy is a strategy value owned by [`crate::map::HeapMap`] and called at
//! fixed points of every structural operation:
//!
//! ```text
//!   put:    new_metadata -> before_insert -> (store, maybe resize) -> after_insert
//!   get:    after_access
//!   remove: after_remove
//! ```
//!
//! Replacing an existing key reports the old entry to `after_remove` before
//! the new one reaches `after_insert`. Hooks receive the table core and may
//! remove entries through it; those removals do not re-enter the policy.

mod fifo;
mod lru;
mod priority;

pub use fifo::Fifo;
pub use lru::Lru;
pub use priority::Priority;

use crate::error::MapResult;
use crate::heap::ByteHeap;
use crate::storage::SlotStorage;
use crate::table::{RemovedEntry, TableCore};

/// Hooks an eviction strategy implements. Every hook defaults to a no-op.
pub trait EvictionPolicy<H: ByteHeap, S: SlotStorage> {
    /// Metadata stored with each new heap object.
    fn new_metadata(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn before_insert(&mut self, _core: &mut TableCore<H, S>) -> MapResult<()> {
        Ok(())
    }

    /// A new heap object was stored at `offset`.
    fn after_insert(&mut self, _core: &mut TableCore<H, S>, _offset: u64) -> MapResult<()> {
        Ok(())
    }

    /// The entry at `offset` was read.
    fn after_access(&mut self, _core: &mut TableCore<H, S>, _offset: u64) -> MapResult<()> {
        Ok(())
    }

    /// An entry left the table; its heap object is already gone.
    fn after_remove(&mut self, _core: &mut TableCore<H, S>, _entry: &RemovedEntry) -> MapResult<()> {
        Ok(())
    }

    /// The table was emptied.
    fn on_clear(&mut self) {}

    /// Policy state persisted in the table header.
    fn state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore(&mut self, _state: &[u8]) -> MapResult<()> {
        Ok(())
    }
}

/// No bound, no metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl<H: ByteHeap, S: SlotStorage> EvictionPolicy<H, S> for Unbounded {}
