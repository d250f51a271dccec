//! Configuration for HeapMap tables
//!
//! Capability flags are fixed when a map is created: they decide which slot
//! bits are reserved as tags and which code paths are legal. The remaining
//! fields size the table, the heap and the eviction policies.

use crate::error::{MapError, MapResult};

/// Largest slot count a table may reach (2^30)
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Default initial slot count
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Default occupancy fraction that triggers a resize
pub const DEFAULT_LOAD_FACTOR: f32 = 0.5;

/// Values longer than this are stored together with their key
pub const DEFAULT_BIG_VALUE_THRESHOLD: usize = 1024;

/// Capability flags chosen at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationFlags {
    /// Reserve a tag bit and allow keys mapped to a null value
    pub support_null_values: bool,
    /// Reserve a tag bit and store `key ++ value` for large values
    pub support_big_values: bool,
    /// Enable the delete path
    pub allow_removals: bool,
    /// Always store the key in front of the value (keys not derivable)
    pub store_keys: bool,
    /// Prefix stored keys with their length
    pub variable_length_keys: bool,
    /// Never let a slot straddle a page boundary in the slot array
    pub align_slots_in_pages: bool,
    /// Convert legacy single-file tables on load
    pub auto_upgrade: bool,
}

impl CreationFlags {
    const NULL_VALUES: u32 = 1 << 0;
    const BIG_VALUES: u32 = 1 << 1;
    const REMOVALS: u32 = 1 << 2;
    const STORE_KEYS: u32 = 1 << 3;
    const VARIABLE_KEYS: u32 = 1 << 4;
    const ALIGN_PAGES: u32 = 1 << 5;

    /// Flags that change the on-disk layout, packed for the header.
    /// `auto_upgrade` is a load-time behaviour and is not persisted.
    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        if self.support_null_values { bits |= Self::NULL_VALUES; }
        if self.support_big_values { bits |= Self::BIG_VALUES; }
        if self.allow_removals { bits |= Self::REMOVALS; }
        if self.store_keys { bits |= Self::STORE_KEYS; }
        if self.variable_length_keys { bits |= Self::VARIABLE_KEYS; }
        if self.align_slots_in_pages { bits |= Self::ALIGN_PAGES; }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            support_null_values: bits & Self::NULL_VALUES != 0,
            support_big_values: bits & Self::BIG_VALUES != 0,
            allow_removals: bits & Self::REMOVALS != 0,
            store_keys: bits & Self::STORE_KEYS != 0,
            variable_length_keys: bits & Self::VARIABLE_KEYS != 0,
            align_slots_in_pages: bits & Self::ALIGN_PAGES != 0,
            auto_upgrade: false,
        }
    }

    /// Bits whose value must match between a persisted table and the map loading it.
    pub(crate) fn layout_bits(&self) -> u32 {
        self.to_bits() & !Self::REMOVALS
    }
}

/// Width of one slot in the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWidth {
    /// 4 bytes per slot
    W32,
    /// 5 bytes per slot
    W40,
    /// 8 bytes per slot
    W64,
}

impl SlotWidth {
    pub fn bytes(self) -> usize {
        match self {
            SlotWidth::W32 => 4,
            SlotWidth::W40 => 5,
            SlotWidth::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            4 => Some(SlotWidth::W32),
            5 => Some(SlotWidth::W40),
            8 => Some(SlotWidth::W64),
            _ => None,
        }
    }
}

/// HeapMap configuration
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Requested slot count, rounded up to a power of two
    pub initial_capacity: usize,
    /// Occupancy fraction at which the table doubles
    pub load_factor: f32,
    /// Capabilities fixed at construction
    pub flags: CreationFlags,
    /// Bytes per slot
    pub slot_width: SlotWidth,
    /// Page size for dirty tracking and optional slot alignment
    pub page_size: usize,
    /// Bound enforced by eviction policies (0 = unbounded)
    pub max_elements: usize,
    /// Memory limit handed to a heap owned by the map
    pub heap_max_memory: u64,
    /// Values longer than this are stored as `key ++ value`
    pub big_value_threshold: usize,
    /// Priority counter value that triggers a reprioritization
    pub max_priority: u32,
    /// Fraction denominator for amortized priority sweeps
    pub eviction_divisor: usize,
    /// Refresh an entry's priority when it is read
    pub move_accessed_to_top: bool,
}

impl MapConfig {
    /// Persistent store: unbounded, null and big values supported.
    pub fn store() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            flags: CreationFlags {
                support_null_values: true,
                support_big_values: true,
                allow_removals: true,
                variable_length_keys: true,
                ..CreationFlags::default()
            },
            slot_width: SlotWidth::W40,
            page_size: 4096,
            max_elements: 0,
            heap_max_memory: 512 * 1024 * 1024,
            big_value_threshold: DEFAULT_BIG_VALUE_THRESHOLD,
            max_priority: i32::MAX as u32,
            eviction_divisor: 10,
            move_accessed_to_top: true,
        }
    }

    /// Bounded cache holding at most `max_elements` keys.
    pub fn cache(max_elements: usize) -> Self {
        let capacity = (max_elements.max(1) * 2).min(MAXIMUM_CAPACITY);
        Self {
            initial_capacity: capacity,
            max_elements,
            heap_max_memory: 128 * 1024 * 1024,
            flags: CreationFlags {
                allow_removals: true,
                variable_length_keys: true,
                ..CreationFlags::default()
            },
            ..Self::store()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> MapResult<()> {
        if self.initial_capacity > MAXIMUM_CAPACITY {
            return Err(MapError::InvalidCapacity {
                requested: self.initial_capacity,
                max: MAXIMUM_CAPACITY,
            });
        }
        if self.load_factor.is_nan() || self.load_factor <= 0.0 {
            return Err(MapError::InvalidLoadFactor(self.load_factor));
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(MapError::InvalidConfig("page_size must be a power of two".into()));
        }
        if self.page_size < self.slot_width.bytes() {
            return Err(MapError::InvalidConfig("page_size must hold at least one slot".into()));
        }
        if self.eviction_divisor < 2 {
            return Err(MapError::InvalidConfig("eviction_divisor must be >= 2".into()));
        }
        if self.max_priority == 0 {
            return Err(MapError::InvalidConfig("max_priority must be > 0".into()));
        }
        if self.heap_max_memory == 0 {
            return Err(MapError::InvalidConfig("heap_max_memory must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for MapConfig {
    fn default() -> Self { Self::store() }
}

/// Smallest power of two >= `cap` (at least 1, at most [`MAXIMUM_CAPACITY`]).
pub(crate) fn table_size_for(cap: usize) -> usize {
    cap.max(1).min(MAXIMUM_CAPACITY).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(MapConfig::store().validate().is_ok());
        assert!(MapConfig::cache(1000).validate().is_ok());
        assert!(MapConfig::cache(0).validate().is_ok());
    }

    #[test]
    fn test_cache_sizes_table_for_bound() {
        let c = MapConfig::cache(1000);
        assert_eq!(c.max_elements, 1000);
        assert_eq!(c.initial_capacity, 2000);
        assert!(c.flags.allow_removals);
        assert!(!c.flags.support_null_values);
    }

    #[test]
    fn test_bad_load_factor_rejected() {
        let mut c = MapConfig::store();
        c.load_factor = 0.0;
        assert!(matches!(c.validate(), Err(MapError::InvalidLoadFactor(_))));
        c.load_factor = -1.0;
        assert!(matches!(c.validate(), Err(MapError::InvalidLoadFactor(_))));
        c.load_factor = f32::NAN;
        assert!(matches!(c.validate(), Err(MapError::InvalidLoadFactor(_))));
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        let mut c = MapConfig::store();
        c.initial_capacity = MAXIMUM_CAPACITY + 1;
        assert!(matches!(c.validate(), Err(MapError::InvalidCapacity { .. })));
    }

    #[test]
    fn test_flag_bits_roundtrip() {
        let flags = CreationFlags {
            support_null_values: true,
            allow_removals: true,
            align_slots_in_pages: true,
            auto_upgrade: true,
            ..CreationFlags::default()
        };
        let back = CreationFlags::from_bits(flags.to_bits());
        assert!(back.support_null_values && back.allow_removals && back.align_slots_in_pages);
        assert!(!back.support_big_values && !back.store_keys);
        // load-time only
        assert!(!back.auto_upgrade);
    }

    #[test]
    fn test_table_size_for() {
        assert_eq!(table_size_for(0), 1);
        assert_eq!(table_size_for(1), 1);
        assert_eq!(table_size_for(16), 16);
        assert_eq!(table_size_for(17), 32);
        assert_eq!(table_size_for(usize::MAX), MAXIMUM_CAPACITY);
    }
}
