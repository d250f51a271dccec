//! Slot codec: packs a heap offset and a state tag into one slot integer.
//!
//! Layout (most significant bits first):
//!
//! ```text
//!   [null bit]? [big bit]? [ pure offset + 1 .............. ]
//! ```
//!
//! A tag bit exists only when its capability is enabled. A disabled
//! capability gives its bit back to the offset field, so a map without null
//! or big value support addresses twice (or four times) as much heap.
//! The stored offset is `pure + 1`, so the all-zero slot always means empty.

use crate::config::{CreationFlags, SlotWidth};
use crate::error::{MapError, MapResult};

/// Raw slot value meaning "empty".
pub const EMPTY_SLOT: u64 = 0;

/// Decoded slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    /// Heap blob holds the value (the key is derived from it, or stored in
    /// front of it when the map stores keys)
    Value(u64),
    /// Heap blob holds the key; the key maps to a null value
    Null(u64),
    /// Heap blob holds `key ++ value`
    Big(u64),
}

impl Slot {
    /// Pure heap offset, or None for an empty slot.
    pub fn offset(&self) -> Option<u64> {
        match *self {
            Slot::Empty => None,
            Slot::Value(ofs) | Slot::Null(ofs) | Slot::Big(ofs) => Some(ofs),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Slot::Null(_))
    }
}

/// Encodes and decodes slots for one fixed set of capabilities.
#[derive(Debug, Clone, Copy)]
pub struct SlotCodec {
    null_bit: u64,
    big_bit: u64,
    offset_mask: u64,
}

impl SlotCodec {
    pub fn new(width: SlotWidth, flags: &CreationFlags) -> Self {
        Self::with_bits(width.bits(), flags.support_null_values, flags.support_big_values)
    }

    pub fn with_bits(bits: u32, support_null: bool, support_big: bool) -> Self {
        let mut free_bits = bits;
        let mut take_top = |enabled: bool| -> u64 {
            if !enabled {
                return 0;
            }
            free_bits -= 1;
            1u64 << free_bits
        };
        let null_bit = take_top(support_null);
        let big_bit = take_top(support_big);
        let offset_mask = if free_bits >= 64 { u64::MAX } else { (1u64 << free_bits) - 1 };
        Self { null_bit, big_bit, offset_mask }
    }

    /// Largest pure offset a slot can address.
    pub fn max_offset(&self) -> u64 {
        self.offset_mask - 1
    }

    pub fn is_empty(raw: u64) -> bool {
        raw == EMPTY_SLOT
    }

    pub fn encode(&self, slot: Slot) -> MapResult<u64> {
        let (ofs, tag) = match slot {
            Slot::Empty => return Ok(EMPTY_SLOT),
            Slot::Value(ofs) => (ofs, 0),
            Slot::Null(ofs) => {
                if self.null_bit == 0 {
                    return Err(MapError::CapabilityDisabled { capability: "support_null_values" });
                }
                (ofs, self.null_bit)
            }
            Slot::Big(ofs) => {
                if self.big_bit == 0 {
                    return Err(MapError::CapabilityDisabled { capability: "support_big_values" });
                }
                (ofs, self.big_bit)
            }
        };
        match ofs.checked_add(1) {
            Some(stored) if stored <= self.offset_mask => Ok(stored | tag),
            _ => Err(MapError::OffsetOverflow { offset: ofs, max: self.max_offset() }),
        }
    }

    pub fn decode(&self, raw: u64) -> Slot {
        if raw == EMPTY_SLOT {
            return Slot::Empty;
        }
        let pure = (raw & self.offset_mask).wrapping_sub(1);
        if raw & self.null_bit != 0 {
            Slot::Null(pure)
        } else if raw & self.big_bit != 0 {
            Slot::Big(pure)
        } else {
            Slot::Value(pure)
        }
    }
}
