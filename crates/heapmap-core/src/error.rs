//! Error types for HeapMap operations
//!
//! Every fallible operation returns a [`MapError`]. Construction errors are
//! fatal, capability violations are caller bugs, and persistence errors carry
//! the path they happened on.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// HeapMap error types with context for debugging and recovery
#[derive(Debug, Clone)]
pub enum MapError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Initial capacity is outside the supported range
    InvalidCapacity {
        requested: usize,
        max: usize,
    },

    /// Load factor is zero, negative or NaN
    InvalidLoadFactor(f32),

    /// Any other rejected configuration parameter
    InvalidConfig(String),

    /// `remove` called on a map built without `allow_removals`
    RemovalsNotAllowed,

    /// An operation needs a capability the map was not created with
    CapabilityDisabled {
        /// Name of the missing creation flag
        capability: &'static str,
    },

    /// The map was structurally modified while a traversal was in progress
    ConcurrentModification {
        /// Modification count when the traversal started
        expected: u64,
        /// Modification count observed afterwards
        found: u64,
    },

    /// The byte heap cannot hold another object
    HeapExhausted {
        /// Bytes requested by the failed allocation
        requested: u64,
        /// Bytes still available in the heap
        available: u64,
    },

    /// A heap offset does not fit in the addressable range of a slot
    OffsetOverflow {
        offset: u64,
        max: u64,
    },

    /// A slot points to an offset the heap doesn't hold
    DanglingOffset(u64),

    /// A heap blob doesn't have the layout its slot tag promises
    CorruptEntry {
        offset: u64,
        reason: String,
    },

    /// The key relation cannot compute a key from a value
    KeyNotDerivable,

    /// Key length differs from the relation's fixed key size
    InvalidKeyLength {
        expected: usize,
        actual: usize,
    },

    /// Header file is malformed
    CorruptHeader {
        path: PathBuf,
        reason: String,
    },

    /// Header checksum verification failed
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    /// Data file is shorter than the header says
    TruncatedData {
        path: PathBuf,
        expected: u64,
        available: u64,
    },

    /// Persisted table was written with a different layout
    IncompatibleFormat {
        path: PathBuf,
        reason: String,
    },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            MapError::InvalidCapacity { requested, max } => {
                write!(f, "Illegal initial capacity: {} (maximum {})", requested, max)
            }

            MapError::InvalidLoadFactor(lf) => write!(f, "Illegal load factor: {}", lf),

            MapError::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),

            MapError::RemovalsNotAllowed => write!(f, "Removals are not allowed on this map"),

            MapError::CapabilityDisabled { capability } => {
                write!(f, "Operation requires the {} creation flag", capability)
            }

            MapError::ConcurrentModification { expected, found } => {
                write!(f, "Map modified during traversal: modification count {} became {}",
                       expected, found)
            }

            MapError::HeapExhausted { requested, available } => {
                write!(f, "Byte heap exhausted: requested {} bytes, {} available",
                       requested, available)
            }

            MapError::OffsetOverflow { offset, max } => {
                write!(f, "Heap offset {} exceeds slot addressable maximum {}", offset, max)
            }

            MapError::DanglingOffset(ofs) => write!(f, "No heap object at offset {}", ofs),

            MapError::CorruptEntry { offset, reason } => {
                write!(f, "Corrupt entry at heap offset {}: {}", offset, reason)
            }

            MapError::KeyNotDerivable => {
                write!(f, "Key relation cannot derive keys from values")
            }

            MapError::InvalidKeyLength { expected, actual } => {
                write!(f, "Key length {} does not match fixed key size {}", actual, expected)
            }

            MapError::CorruptHeader { path, reason } => {
                write!(f, "Corrupt header {}: {}", path.display(), reason)
            }

            MapError::ChecksumMismatch { path, expected, actual } => {
                write!(f, "Checksum mismatch in {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), expected, actual)
            }

            MapError::TruncatedData { path, expected, available } => {
                write!(f, "Truncated data file {}: expected {} bytes, only {} available",
                       path.display(), expected, available)
            }

            MapError::IncompatibleFormat { path, reason } => {
                write!(f, "Incompatible table format in {}: {}", path.display(), reason)
            }
        }
    }
}

impl Error for MapError {}

/// Convert std::io::Error to MapError::Io
impl From<std::io::Error> for MapError {
    fn from(err: std::io::Error) -> Self {
        MapError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl MapError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io_at(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        MapError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Result type alias for HeapMap operations
pub type MapResult<T> = Result<T, MapError>;
