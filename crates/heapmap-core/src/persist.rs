//! Table persistence: a header file next to a raw slot-array data file.
//!
//! ## Files
//!
//! - `<path>`: the slot array exactly as [`SlotStorage::copy_to`] writes it
//! - `<path>.hdr`: the header
//!
//! ## Header layout (big-endian)
//!
//! ```text
//!   [db_version u32][total_slots u32][size u32][threshold u32]
//!   [flags u32][slot_width u8][state_len u32][policy state][crc32c u32]
//! ```
//!
//! The first 16 bytes are the whole header in the legacy form, which is still
//! accepted on load. The CRC covers every byte before it.
//!
//! Older tables kept a 12-byte `[total_slots][size][threshold]` header at the
//! front of the data file. [`convert_legacy`] moves it out into a header file
//! with the write-temp / sync / rename / sync-dir sequence.
//!
//! The heap is not persisted here; its owner saves and reloads it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{CreationFlags, SlotWidth, MAXIMUM_CAPACITY};
use crate::durability::{durable_sync, sync_parent_dir};
use crate::error::{MapError, MapResult};
use crate::heap::ByteHeap;
use crate::storage::{slot_array_bytes, SlotStorage};
use crate::table::TableCore;

/// Current header format version
pub const FORMAT_VERSION: u32 = 1;

/// Size of the fixed header part (and of the whole legacy header)
pub const BASE_HEADER_LEN: usize = 16;

/// Size of the header embedded at the front of legacy data files
pub const LEGACY_EMBEDDED_HEADER_LEN: usize = 12;

/// flags + slot width + state length + crc
const EXTENSION_FIXED_LEN: usize = 4 + 1 + 4 + 4;

/// Header file belonging to a data file.
pub fn header_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".hdr");
    PathBuf::from(name)
}

fn temp_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Layout and policy details appended to the base header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub flags: u32,
    pub slot_width: u8,
    pub policy_state: Vec<u8>,
}

/// Decoded table header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    pub db_version: u32,
    pub total_slots: u32,
    pub size: u32,
    pub threshold: u32,
    /// None for the bare 16-byte form
    pub extension: Option<HeaderExtension>,
}

impl TableHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BASE_HEADER_LEN + EXTENSION_FIXED_LEN);
        buf.extend_from_slice(&self.db_version.to_be_bytes());
        buf.extend_from_slice(&self.total_slots.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.threshold.to_be_bytes());
        if let Some(ext) = &self.extension {
            buf.extend_from_slice(&ext.flags.to_be_bytes());
            buf.push(ext.slot_width);
            buf.extend_from_slice(&(ext.policy_state.len() as u32).to_be_bytes());
            buf.extend_from_slice(&ext.policy_state);
            let crc = crc32c::crc32c(&buf);
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        buf
    }

    pub fn decode(path: &Path, bytes: &[u8]) -> MapResult<Self> {
        let corrupt = |reason: String| MapError::CorruptHeader { path: path.to_path_buf(), reason };
        if bytes.len() < BASE_HEADER_LEN {
            return Err(corrupt(format!(
                "header is {} bytes, need at least {}", bytes.len(), BASE_HEADER_LEN
            )));
        }
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut header = Self {
            db_version: u32_at(0),
            total_slots: u32_at(4),
            size: u32_at(8),
            threshold: u32_at(12),
            extension: None,
        };
        if bytes.len() == BASE_HEADER_LEN {
            return Ok(header);
        }

        if bytes.len() < BASE_HEADER_LEN + EXTENSION_FIXED_LEN {
            return Err(corrupt(format!("truncated header extension ({} bytes)", bytes.len())));
        }
        let state_len = u32_at(BASE_HEADER_LEN + 5) as usize;
        let expected = BASE_HEADER_LEN + EXTENSION_FIXED_LEN + state_len;
        if bytes.len() != expected {
            return Err(corrupt(format!(
                "header is {} bytes, extension declares {}", bytes.len(), expected
            )));
        }
        let body = &bytes[..expected - 4];
        let stored = u32_at(expected - 4);
        let actual = crc32c::crc32c(body);
        if stored != actual {
            return Err(MapError::ChecksumMismatch { path: path.to_path_buf(), expected: stored, actual });
        }
        let state_start = BASE_HEADER_LEN + 9;
        header.extension = Some(HeaderExtension {
            flags: u32_at(BASE_HEADER_LEN),
            slot_width: bytes[BASE_HEADER_LEN + 4],
            policy_state: bytes[state_start..state_start + state_len].to_vec(),
        });
        Ok(header)
    }
}

pub fn read_header(path: &Path) -> MapResult<TableHeader> {
    let bytes = fs::read(path).map_err(|e| MapError::io_at(path, e, "Failed to read header"))?;
    TableHeader::decode(path, &bytes)
}

pub fn write_header(path: &Path, header: &TableHeader) -> MapResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| MapError::io_at(path, e, "Failed to create header"))?;
    file.write_all(&header.encode())
        .map_err(|e| MapError::io_at(path, e, "Failed to write header"))?;
    durable_sync(&file).map_err(|e| MapError::io_at(path, e, "Failed to sync header"))
}

/// Move the header embedded at the front of a legacy data file into a
/// separate header file.
///
/// 1. Copy the data file minus its first 12 bytes to `<path>.tmp`
/// 2. durable_sync the copy
/// 3. Rename it over the original
/// 4. Sync the directory
/// 5. Write `<path>.hdr`
///
/// A crash before the rename leaves the original intact.
pub fn convert_legacy(data_path: &Path) -> MapResult<TableHeader> {
    let mut src = File::open(data_path)
        .map_err(|e| MapError::io_at(data_path, e, "Failed to open legacy table"))?;
    let mut embedded = [0u8; LEGACY_EMBEDDED_HEADER_LEN];
    src.read_exact(&mut embedded).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => MapError::TruncatedData {
            path: data_path.to_path_buf(),
            expected: LEGACY_EMBEDDED_HEADER_LEN as u64,
            available: fs::metadata(data_path).map(|m| m.len()).unwrap_or(0),
        },
        _ => MapError::io_at(data_path, e, "Failed to read legacy header"),
    })?;
    let u32_at = |at: usize| {
        u32::from_be_bytes([embedded[at], embedded[at + 1], embedded[at + 2], embedded[at + 3]])
    };
    let header = TableHeader {
        db_version: FORMAT_VERSION,
        total_slots: u32_at(0),
        size: u32_at(4),
        threshold: u32_at(8),
        extension: None,
    };

    let tmp = temp_path(data_path);
    {
        let mut dst = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| MapError::io_at(&tmp, e, "Failed to create conversion file"))?;
        io::copy(&mut src, &mut dst)
            .map_err(|e| MapError::io_at(&tmp, e, "Failed to copy slot data"))?;
        durable_sync(&dst).map_err(|e| MapError::io_at(&tmp, e, "Failed to sync conversion file"))?;
    }
    drop(src);

    fs::rename(&tmp, data_path)
        .map_err(|e| MapError::io_at(data_path, e, "Failed to rename converted table"))?;
    sync_parent_dir(data_path)
        .map_err(|e| MapError::io_at(data_path, e, "Failed to sync directory after conversion"))?;
    write_header(&header_path(data_path), &header)?;

    info!(path = %data_path.display(), slots = header.total_slots, size = header.size,
          "legacy table converted");
    Ok(header)
}

impl<H: ByteHeap, S: SlotStorage> TableCore<H, S> {
    /// Set the data file path. The next save writes the whole array.
    pub fn set_path(&mut self, path: &Path) {
        self.path = Some(path.to_path_buf());
        self.loaded = false;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when the slot array differs from what's on disk.
    pub fn is_modified(&self) -> bool {
        !self.loaded || self.resized || self.slots.as_ref().is_some_and(S::modified)
    }

    fn require_path(&self) -> MapResult<PathBuf> {
        self.path.clone()
            .ok_or_else(|| MapError::InvalidConfig("table has no path, call set_path first".into()))
    }

    /// Write the slot array (if modified) and the header.
    ///
    /// A table loaded from this path and not resized since is written back
    /// page by page; otherwise the whole array is copied.
    pub fn save(&mut self, policy_state: &[u8]) -> MapResult<()> {
        let path = self.require_path()?;
        let modified = self.is_modified();
        let incremental = self.loaded && !self.resized;

        if modified {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| MapError::io_at(&path, e, "Failed to open data file"))?;
            match self.slots.as_mut() {
                Some(slots) if incremental => slots.update(&mut file, 0)
                    .map_err(|e| MapError::io_at(&path, e, "Failed to update slot pages"))?,
                Some(slots) => {
                    slots.copy_to(&mut file, 0)
                        .map_err(|e| MapError::io_at(&path, e, "Failed to write slot array"))?;
                    file.set_len(slots.byte_len())
                        .map_err(|e| MapError::io_at(&path, e, "Failed to truncate data file"))?;
                }
                None => file.set_len(0)
                    .map_err(|e| MapError::io_at(&path, e, "Failed to truncate data file"))?,
            }
            durable_sync(&file).map_err(|e| MapError::io_at(&path, e, "Failed to sync data file"))?;
        }

        let header = TableHeader {
            db_version: FORMAT_VERSION,
            total_slots: self.capacity() as u32,
            size: self.size as u32,
            threshold: self.threshold as u32,
            extension: Some(HeaderExtension {
                flags: self.flags.to_bits(),
                slot_width: self.slot_width.bytes() as u8,
                policy_state: policy_state.to_vec(),
            }),
        };
        write_header(&header_path(&path), &header)?;
        if !self.loaded {
            sync_parent_dir(&path).map_err(|e| MapError::io_at(&path, e, "Failed to sync directory"))?;
        }

        self.loaded = true;
        self.resized = false;
        info!(path = %path.display(), slots = header.total_slots, size = self.size,
              written = modified, incremental = modified && incremental, "table saved");
        Ok(())
    }

    /// Replace the table with the one persisted at the configured path and
    /// return the stored policy state.
    ///
    /// With `auto_upgrade`, a data file without a header file is treated as a
    /// legacy table and converted first.
    pub fn load(&mut self) -> MapResult<Vec<u8>> {
        let path = self.require_path()?;
        let hdr_path = header_path(&path);
        if self.flags.auto_upgrade && !hdr_path.exists() && path.exists() {
            convert_legacy(&path)?;
        }
        let header = read_header(&hdr_path)?;
        let incompatible = |reason: String| MapError::IncompatibleFormat { path: hdr_path.clone(), reason };
        let corrupt = |reason: String| MapError::CorruptHeader { path: hdr_path.clone(), reason };

        if header.db_version == 0 || header.db_version > FORMAT_VERSION {
            return Err(incompatible(format!("unsupported format version {}", header.db_version)));
        }
        let total = header.total_slots as usize;
        if total != 0 && (!total.is_power_of_two() || total > MAXIMUM_CAPACITY) {
            return Err(corrupt(format!("slot count {} is not a power of two in range", total)));
        }
        let size = header.size as usize;
        if (total == 0 && size != 0) || (total != 0 && size >= total) {
            return Err(corrupt(format!("size {} does not fit {} slots", size, total)));
        }

        let mut state = Vec::new();
        if let Some(ext) = &header.extension {
            let stored = CreationFlags::from_bits(ext.flags).layout_bits();
            if stored != self.flags.layout_bits() {
                return Err(incompatible(format!(
                    "layout flags 0x{:x} differ from configured 0x{:x}", stored, self.flags.layout_bits()
                )));
            }
            if SlotWidth::from_bytes(ext.slot_width) != Some(self.slot_width) {
                return Err(incompatible(format!(
                    "slot width {} differs from configured {}", ext.slot_width, self.slot_width.bytes()
                )));
            }
            state = ext.policy_state.clone();
        }

        let slots = if total == 0 {
            None
        } else {
            let expected = slot_array_bytes(total, self.slot_width, self.page_size,
                                            self.flags.align_slots_in_pages);
            let available = fs::metadata(&path)
                .map_err(|e| MapError::io_at(&path, e, "Failed to stat data file"))?
                .len();
            if available < expected {
                return Err(MapError::TruncatedData { path: path.clone(), expected, available });
            }
            let file = File::open(&path).map_err(|e| MapError::io_at(&path, e, "Failed to open data file"))?;
            let mut slots = S::allocate(total, self.slot_width, self.page_size, self.flags.align_slots_in_pages);
            slots.read_from(&mut BufReader::new(file), total)
                .map_err(|e| MapError::io_at(&path, e, "Failed to read slot array"))?;
            Some(slots)
        };

        self.slots = slots;
        self.size = size;
        self.threshold = (header.threshold as usize).min(total.saturating_sub(1));
        self.loaded = true;
        self.resized = false;
        self.mod_count += 1;
        info!(path = %path.display(), slots = total, size, "table loaded");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::config::MapConfig;
    use crate::heap::{shared, MemHeap, SharedHeap};
    use crate::keys::StoredKeys;
    use crate::storage::PackedSlots;

    type Core = TableCore<MemHeap, PackedSlots>;

    fn test_core(heap: &SharedHeap<MemHeap>) -> Core {
        Core::new(&MapConfig::store(), Arc::new(StoredKeys), Arc::clone(heap), true).unwrap()
    }

    fn put(core: &mut Core, key: &[u8], value: &[u8]) {
        core.put_val(key, Some(value), true, &mut || None).unwrap();
    }

    #[test]
    fn test_header_roundtrip() {
        let header = TableHeader {
            db_version: FORMAT_VERSION,
            total_slots: 64,
            size: 10,
            threshold: 32,
            extension: Some(HeaderExtension { flags: 0b1011, slot_width: 5, policy_state: vec![1, 2, 3] }),
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), BASE_HEADER_LEN + EXTENSION_FIXED_LEN + 3);
        assert_eq!(&bytes[4..8], &64u32.to_be_bytes());
        assert_eq!(TableHeader::decode(Path::new("t.hdr"), &bytes).unwrap(), header);
    }

    #[test]
    fn test_legacy_sixteen_byte_header() {
        let mut bytes = Vec::new();
        for v in [1u32, 16, 3, 8] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let header = TableHeader::decode(Path::new("t.hdr"), &bytes).unwrap();
        assert_eq!((header.total_slots, header.size, header.threshold), (16, 3, 8));
        assert!(header.extension.is_none());
    }

    #[test]
    fn test_header_corruption_detected() {
        let header = TableHeader {
            db_version: FORMAT_VERSION,
            total_slots: 16,
            size: 1,
            threshold: 8,
            extension: Some(HeaderExtension { flags: 1, slot_width: 4, policy_state: Vec::new() }),
        };
        let mut bytes = header.encode();
        bytes[9] ^= 0xFF;
        assert!(matches!(TableHeader::decode(Path::new("t.hdr"), &bytes),
                         Err(MapError::ChecksumMismatch { .. })));
        assert!(matches!(TableHeader::decode(Path::new("t.hdr"), &bytes[..10]),
                         Err(MapError::CorruptHeader { .. })));
        assert!(matches!(TableHeader::decode(Path::new("t.hdr"), &bytes[..20]),
                         Err(MapError::CorruptHeader { .. })));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.dat");
        let heap = shared(MemHeap::default());

        let mut core = test_core(&heap);
        for i in 0..20 {
            put(&mut core, format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes());
        }
        core.set_path(&path);
        core.save(&[7, 7]).unwrap();
        assert!(!core.is_modified());
        assert!(header_path(&path).exists());

        let mut reloaded = test_core(&heap);
        reloaded.set_path(&path);
        assert_eq!(reloaded.load().unwrap(), vec![7, 7]);
        assert_eq!(reloaded.len(), 20);
        assert_eq!(reloaded.capacity(), core.capacity());
        for i in 0..20 {
            let found = reloaded.lookup(format!("k{}", i).as_bytes()).unwrap().unwrap();
            assert_eq!(found.value, Some(format!("v{}", i).into_bytes()));
        }
    }

    #[test]
    fn test_incremental_save_after_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.dat");
        let heap = shared(MemHeap::default());

        let mut core = test_core(&heap);
        put(&mut core, b"a", b"1");
        core.set_path(&path);
        core.save(&[]).unwrap();
        let len_before = fs::metadata(&path).unwrap().len();

        put(&mut core, b"b", b"2");
        assert!(core.is_modified());
        core.save(&[]).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);

        let mut reloaded = test_core(&heap);
        reloaded.set_path(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.lookup(b"b").unwrap().unwrap().value, Some(b"2".to_vec()));
    }

    #[test]
    fn test_load_rejects_other_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.dat");
        let heap = shared(MemHeap::default());
        let mut core = test_core(&heap);
        put(&mut core, b"a", b"1");
        core.set_path(&path);
        core.save(&[]).unwrap();

        let mut config = MapConfig::store();
        config.slot_width = SlotWidth::W64;
        let mut other = Core::new(&config, Arc::new(StoredKeys), Arc::clone(&heap), true).unwrap();
        other.set_path(&path);
        assert!(matches!(other.load(), Err(MapError::IncompatibleFormat { .. })));
    }

    #[test]
    fn test_load_truncated_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.dat");
        let heap = shared(MemHeap::default());
        let mut core = test_core(&heap);
        put(&mut core, b"a", b"1");
        core.set_path(&path);
        core.save(&[]).unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(10).unwrap();
        drop(file);
        let mut reloaded = test_core(&heap);
        reloaded.set_path(&path);
        assert!(matches!(reloaded.load(), Err(MapError::TruncatedData { available: 10, .. })));
    }

    #[test]
    fn test_missing_header_is_io_error() {
        let dir = TempDir::new().unwrap();
        let heap = shared(MemHeap::default());
        let mut core = test_core(&heap);
        core.set_path(&dir.path().join("absent.dat"));
        match core.load() {
            Err(MapError::Io { kind, path, .. }) => {
                assert_eq!(kind, io::ErrorKind::NotFound);
                assert!(path.is_some());
            }
            other => panic!("expected Io error, got {:?}", other.map(|_| ())),
        }
        let mut no_path = test_core(&heap);
        assert!(matches!(no_path.save(&[]), Err(MapError::InvalidConfig(_))));
    }

    #[test]
    fn test_convert_legacy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.dat");
        let mut bytes = Vec::new();
        for v in [4u32, 1, 2] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let slots = [9u8; 20];
        bytes.extend_from_slice(&slots);
        fs::write(&path, &bytes).unwrap();

        let header = convert_legacy(&path).unwrap();
        assert_eq!((header.total_slots, header.size, header.threshold), (4, 1, 2));
        assert_eq!(fs::read(&path).unwrap(), slots.to_vec());
        assert_eq!(read_header(&header_path(&path)).unwrap(), header);
        assert!(!temp_path(&path).exists());
    }
}
