//! Index-based doubly-linked list.
//!
//! Nodes are heap offsets; their prev/next links live in a [`LinkStore`],
//! which is either per-entry heap metadata (FIFO eviction) or an in-memory
//! map (recency tracking in [`crate::heap::LruMemHeap`]). The list itself only
//! owns head, tail and length.

use hashbrown::HashMap;

use crate::error::{MapError, MapResult};

/// Size of the links blob kept in heap metadata: `[prev u32 BE][next u32 BE]`.
pub const LINKS_METADATA_LEN: usize = 8;

/// Neighbours of one list node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    pub prev: Option<u64>,
    pub next: Option<u64>,
}

impl Links {
    /// Pack into metadata bytes. Each link is stored as `offset + 1`, 0 = none.
    pub fn to_metadata(&self) -> MapResult<[u8; LINKS_METADATA_LEN]> {
        let mut buf = [0u8; LINKS_METADATA_LEN];
        buf[0..4].copy_from_slice(&pack_link(self.prev)?.to_be_bytes());
        buf[4..8].copy_from_slice(&pack_link(self.next)?.to_be_bytes());
        Ok(buf)
    }

    /// Unpack from metadata bytes; a short or missing blob means "unlinked".
    pub fn from_metadata(bytes: Option<&[u8]>) -> Self {
        match bytes {
            Some(b) if b.len() >= LINKS_METADATA_LEN => Self {
                prev: unpack_link(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                next: unpack_link(u32::from_be_bytes([b[4], b[5], b[6], b[7]])),
            },
            _ => Self::default(),
        }
    }
}

fn pack_link(link: Option<u64>) -> MapResult<u32> {
    match link {
        None => Ok(0),
        Some(ofs) if ofs < u32::MAX as u64 => Ok(ofs as u32 + 1),
        Some(ofs) => Err(MapError::OffsetOverflow { offset: ofs, max: u32::MAX as u64 - 1 }),
    }
}

fn unpack_link(raw: u32) -> Option<u64> {
    if raw == 0 { None } else { Some(raw as u64 - 1) }
}

/// Where list links are kept.
pub trait LinkStore {
    fn links(&self, node: u64) -> MapResult<Links>;
    fn set_links(&mut self, node: u64, links: Links) -> MapResult<()>;
}

impl LinkStore for HashMap<u64, Links> {
    fn links(&self, node: u64) -> MapResult<Links> {
        Ok(self.get(&node).copied().unwrap_or_default())
    }

    fn set_links(&mut self, node: u64, links: Links) -> MapResult<()> {
        self.insert(node, links);
        Ok(())
    }
}

/// Head, tail and length of a list whose links live in a [`LinkStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkedList {
    head: Option<u64>,
    tail: Option<u64>,
    len: usize,
}

impl LinkedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest node.
    pub fn front(&self) -> Option<u64> {
        self.head
    }

    /// Newest node.
    pub fn back(&self) -> Option<u64> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn push_back<L: LinkStore + ?Sized>(&mut self, store: &mut L, node: u64) -> MapResult<()> {
        store.set_links(node, Links { prev: self.tail, next: None })?;
        match self.tail {
            Some(tail) => {
                let mut links = store.links(tail)?;
                links.next = Some(node);
                store.set_links(tail, links)?;
            }
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Unlink `node` given the links it had. The node itself is not touched,
    /// so this works after its storage is already gone.
    pub fn unlink_with<L: LinkStore + ?Sized>(&mut self, store: &mut L, node: u64, links: Links)
        -> MapResult<()>
    {
        match links.prev {
            Some(prev) => {
                let mut l = store.links(prev)?;
                l.next = links.next;
                store.set_links(prev, l)?;
            }
            None if self.head == Some(node) => self.head = links.next,
            None => {}
        }
        match links.next {
            Some(next) => {
                let mut l = store.links(next)?;
                l.prev = links.prev;
                store.set_links(next, l)?;
            }
            None if self.tail == Some(node) => self.tail = links.prev,
            None => {}
        }
        self.len = self.len.saturating_sub(1);
        Ok(())
    }

    /// Unlink a node that is still present in the store and reset its links.
    pub fn unlink<L: LinkStore + ?Sized>(&mut self, store: &mut L, node: u64) -> MapResult<()> {
        let links = store.links(node)?;
        self.unlink_with(store, node, links)?;
        store.set_links(node, Links::default())
    }

    /// Move a present node to the back.
    pub fn move_to_back<L: LinkStore + ?Sized>(&mut self, store: &mut L, node: u64) -> MapResult<()> {
        if self.tail == Some(node) {
            return Ok(());
        }
        self.unlink(store, node)?;
        self.push_back(store, node)
    }

    pub fn pop_front<L: LinkStore + ?Sized>(&mut self, store: &mut L) -> MapResult<Option<u64>> {
        match self.head {
            Some(node) => {
                self.unlink(store, node)?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Serialize head, tail and length (20 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&self.head.map_or(0, |h| h + 1).to_be_bytes());
        buf.extend_from_slice(&self.tail.map_or(0, |t| t + 1).to_be_bytes());
        buf.extend_from_slice(&(self.len as u32).to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> MapResult<Self> {
        if bytes.len() < 20 {
            return Err(MapError::InvalidConfig(format!(
                "list state needs 20 bytes, got {}", bytes.len()
            )));
        }
        let read_u64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(b)
        };
        let unpack = |raw: u64| if raw == 0 { None } else { Some(raw - 1) };
        Ok(Self {
            head: unpack(read_u64(0)),
            tail: unpack(read_u64(8)),
            len: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize,
        })
    }
}
