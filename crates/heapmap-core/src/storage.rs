//! Slot storage: a fixed-width array of integer slots.
//!
//! [`PackedSlots`] keeps the slots big-endian in a byte vector, 4, 5 or 8
//! bytes each, and tracks which pages changed since the last save so that an
//! unresized table can be written back incrementally.
//!
//! With page alignment enabled a slot never straddles a page: each page holds
//! `page_size / width` slots and the tail of the page is padding.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::config::SlotWidth;

/// Storage backend for the slot array of a table.
pub trait SlotStorage {
    /// Allocate `len` empty slots.
    fn allocate(len: usize, width: SlotWidth, page_size: usize, align_in_pages: bool) -> Self
    where
        Self: Sized;

    fn get(&self, index: usize) -> u64;

    fn set(&mut self, index: usize, value: u64);

    /// Number of slots.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fill(&mut self, value: u64);

    /// Forget which pages were modified.
    fn clear_page_tracking(&mut self);

    /// True if any slot changed since the last load, save or clear.
    fn modified(&self) -> bool;

    /// Serialized size in bytes.
    fn byte_len(&self) -> u64;

    /// Read `count` slots (the whole array) from `reader`.
    fn read_from<R: Read>(&mut self, reader: &mut R, count: usize) -> io::Result<()>;

    /// Write back only the modified pages, the array starting at `offset`.
    fn update<F: Write + Seek>(&mut self, file: &mut F, offset: u64) -> io::Result<()>;

    /// Write the whole array starting at `offset`.
    fn copy_to<F: Write + Seek>(&mut self, file: &mut F, offset: u64) -> io::Result<()>;
}

/// Serialized size of a slot array with the given geometry.
pub fn slot_array_bytes(len: usize, width: SlotWidth, page_size: usize, align_in_pages: bool) -> u64 {
    let width = width.bytes();
    if align_in_pages {
        let per_page = page_size / width;
        (len.div_ceil(per_page) * page_size) as u64
    } else {
        (len * width) as u64
    }
}

/// In-process slot array packed into a byte vector.
#[derive(Debug, Clone)]
pub struct PackedSlots {
    bytes: Vec<u8>,
    len: usize,
    width: usize,
    page_size: usize,
    per_page: usize,
    aligned: bool,
    dirty_pages: Vec<u64>,
    dirty: bool,
}

impl PackedSlots {
    #[inline]
    fn position(&self, index: usize) -> usize {
        if self.aligned {
            (index / self.per_page) * self.page_size + (index % self.per_page) * self.width
        } else {
            index * self.width
        }
    }

    fn page_count(&self) -> usize {
        self.bytes.len().div_ceil(self.page_size)
    }

    fn mark_dirty(&mut self, pos: usize) {
        let first = pos / self.page_size;
        let last = (pos + self.width - 1) / self.page_size;
        for page in first..=last {
            self.dirty_pages[page / 64] |= 1 << (page % 64);
        }
        self.dirty = true;
    }

    fn is_page_dirty(&self, page: usize) -> bool {
        self.dirty_pages[page / 64] & (1 << (page % 64)) != 0
    }

    /// Number of pages that would be written by [`SlotStorage::update`].
    pub fn dirty_page_count(&self) -> usize {
        self.dirty_pages.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl SlotStorage for PackedSlots {
    fn allocate(len: usize, width: SlotWidth, page_size: usize, align_in_pages: bool) -> Self {
        let byte_len = slot_array_bytes(len, width, page_size, align_in_pages) as usize;
        let pages = byte_len.div_ceil(page_size);
        Self {
            bytes: vec![0u8; byte_len],
            len,
            width: width.bytes(),
            page_size,
            per_page: page_size / width.bytes(),
            aligned: align_in_pages,
            dirty_pages: vec![0u64; pages.div_ceil(64)],
            dirty: false,
        }
    }

    #[inline]
    fn get(&self, index: usize) -> u64 {
        let pos = self.position(index);
        let mut buf = [0u8; 8];
        buf[8 - self.width..].copy_from_slice(&self.bytes[pos..pos + self.width]);
        u64::from_be_bytes(buf)
    }

    #[inline]
    fn set(&mut self, index: usize, value: u64) {
        debug_assert!(self.width == 8 || value >> (self.width * 8) == 0, "slot value too wide");
        let pos = self.position(index);
        let buf = value.to_be_bytes();
        self.bytes[pos..pos + self.width].copy_from_slice(&buf[8 - self.width..]);
        self.mark_dirty(pos);
    }

    fn len(&self) -> usize {
        self.len
    }

    fn fill(&mut self, value: u64) {
        if value == 0 {
            self.bytes.iter_mut().for_each(|b| *b = 0);
            let pages = self.page_count();
            for page in 0..pages {
                self.dirty_pages[page / 64] |= 1 << (page % 64);
            }
            self.dirty = true;
        } else {
            for i in 0..self.len {
                self.set(i, value);
            }
        }
    }

    fn clear_page_tracking(&mut self) {
        self.dirty_pages.iter_mut().for_each(|w| *w = 0);
        self.dirty = false;
    }

    fn modified(&self) -> bool {
        self.dirty
    }

    fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_from<R: Read>(&mut self, reader: &mut R, count: usize) -> io::Result<()> {
        if count != self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot count {} does not match allocated {}", count, self.len),
            ));
        }
        reader.read_exact(&mut self.bytes)?;
        self.clear_page_tracking();
        Ok(())
    }

    fn update<F: Write + Seek>(&mut self, file: &mut F, offset: u64) -> io::Result<()> {
        let pages = self.page_count();
        let mut page = 0;
        while page < pages {
            if !self.is_page_dirty(page) {
                page += 1;
                continue;
            }
            // coalesce a run of dirty pages into one write
            let run_start = page;
            while page < pages && self.is_page_dirty(page) {
                page += 1;
            }
            let start = run_start * self.page_size;
            let end = (page * self.page_size).min(self.bytes.len());
            file.seek(SeekFrom::Start(offset + start as u64))?;
            file.write_all(&self.bytes[start..end])?;
        }
        self.clear_page_tracking();
        Ok(())
    }

    fn copy_to<F: Write + Seek>(&mut self, file: &mut F, offset: u64) -> io::Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.bytes)?;
        self.clear_page_tracking();
        Ok(())
    }
}
