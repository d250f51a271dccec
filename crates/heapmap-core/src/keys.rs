//! Key relations: how a table gets from a value to its key, and how keys hash.
//!
//! When a key can be computed from its value the heap only stores the value.
//! Otherwise the map must be built with `store_keys` so every blob carries
//! its key in front of the value.

use std::fmt;

/// Relation between keys and values.
pub trait KeyRelation: Send + Sync + fmt::Debug {
    /// Compute the key of `value`, or None if keys can't be derived.
    fn compute_key(&self, value: &[u8]) -> Option<Vec<u8>>;

    /// Table hash of a key. Must be stable across process restarts since
    /// persisted tables are probed with it.
    fn hash(&self, key: &[u8]) -> u32 {
        crc32c::crc32c(key)
    }

    /// Fixed key length in bytes, None for variable-length keys.
    fn key_size(&self) -> Option<usize> {
        None
    }

    /// Whether [`KeyRelation::compute_key`] can ever succeed.
    fn derives_keys(&self) -> bool {
        true
    }
}

/// Keys are opaque and always stored next to the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredKeys;

impl KeyRelation for StoredKeys {
    fn compute_key(&self, _value: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn derives_keys(&self) -> bool {
        false
    }
}

/// The key is the first `len` bytes of the value.
#[derive(Debug, Clone, Copy)]
pub struct PrefixKeys {
    len: usize,
}

impl PrefixKeys {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl KeyRelation for PrefixKeys {
    fn compute_key(&self, value: &[u8]) -> Option<Vec<u8>> {
        value.get(..self.len).map(<[u8]>::to_vec)
    }

    fn key_size(&self) -> Option<usize> {
        Some(self.len)
    }
}

/// Key computed by a closure, e.g. a digest of the value.
pub struct FnKeys<F> {
    compute: F,
    key_size: Option<usize>,
}

impl<F> FnKeys<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    pub fn new(compute: F) -> Self {
        Self { compute, key_size: None }
    }

    /// Declare that every computed key is `len` bytes long.
    pub fn with_key_size(mut self, len: usize) -> Self {
        self.key_size = Some(len);
        self
    }
}

impl<F> fmt::Debug for FnKeys<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKeys").field("key_size", &self.key_size).finish_non_exhaustive()
    }
}

impl<F> KeyRelation for FnKeys<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    fn compute_key(&self, value: &[u8]) -> Option<Vec<u8>> {
        Some((self.compute)(value))
    }

    fn key_size(&self) -> Option<usize> {
        self.key_size
    }
}
