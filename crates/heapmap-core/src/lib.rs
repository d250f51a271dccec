//! HeapMap Core: open-addressed maps over an external byte heap
//!
//! A hash map whose slot array holds only integer handles. Keys and values
//! live as byte objects in a separate heap that may be shared by several
//! maps, so the table itself stays small and can be saved page by page.
//!
//! # Architecture
//!
//! - **Slot array**: power-of-two linear probing, 4/5/8-byte slots with
//!   optional null and big-value tag bits ([`codec`], [`storage`])
//! - **Heap**: offsets into a [`ByteHeap`] holding data plus per-object metadata
//! - **Deletes**: no tombstones; the probe run is compacted on removal
//! - **Eviction**: FIFO, LRU or priority policies hooked into every insert
//! - **Persistence**: raw slot array plus a checksummed header file
//!
//! # Keys
//!
//! A [`KeyRelation`] either derives the key from a stored value (the heap
//! holds values only) or keys are stored in front of each value.

pub mod codec;
pub mod config;
pub mod durability;
pub mod error;
pub mod eviction;
pub mod heap;
pub mod keys;
pub mod links;
pub mod map;
pub mod persist;
pub mod storage;
pub mod table;

// Re-export key types for convenience
pub use codec::{Slot, SlotCodec};
pub use config::{CreationFlags, MapConfig, SlotWidth};
pub use error::{MapError, MapResult};
pub use eviction::{EvictionPolicy, Fifo, Lru, Priority, Unbounded};
pub use heap::{shared, ByteHeap, LruHeap, LruMemHeap, MemHeap, SharedHeap};
pub use keys::{FnKeys, KeyRelation, PrefixKeys, StoredKeys};
pub use map::{FifoMap, HeapMap, LruMap, PriorityMap};
pub use persist::{convert_legacy, header_path, TableHeader};
pub use storage::{PackedSlots, SlotStorage};
pub use table::{EntryRef, Lookup, MapEntry, PutOutcome, RemovedEntry, ScanCursor, TableCore, TableItem, TableStats};
