//! # Free List
//!
//! This module implements free page tracking for shadowdb. Pages superseded
//! by copy-on-write updates are not reclaimed by truncating the file; their
//! numbers are pushed onto a persistent LIFO and handed back out to later
//! transactions, which is what bounds file growth in steady state.
//!
//! ## Trunk Page Layout
//!
//! The list is a null-terminated chain of trunk pages, stored in the same
//! page file they manage:
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       2         page type (FreeList)
//! 2       2         count: number of entries in this trunk
//! 4       8         total: list-wide entry count (head trunk only)
//! 12      8         next: page number of the next trunk (0 = end)
//! 20      8*N       entries: free page numbers, oldest first
//! ```
//!
//! With 4KB pages each trunk holds (4096 - 20) / 8 = 509 entries. The head
//! trunk caches the list-wide total so `total()` is O(1).
//!
//! ## Update Algorithm
//!
//! A commit performs one combined operation: remove the `popn` entries the
//! transaction consumed and push the pages it freed. Three phases:
//!
//! 1. **Drain**: walk from the head, dropping trunks the pop fully consumes.
//!    A dropped trunk's own page number joins the freed set.
//! 2. **Harvest**: in the first partially-consumed trunk, peel entries off
//!    the top into a `reuse` pool until the pool can host every new trunk
//!    the push will need; the rest of the trunk's entries join the freed
//!    set and the trunk is dropped too.
//! 3. **Push**: chunk the freed set into new trunks, each linked in front of
//!    the remaining chain. New trunks are hosted on pages from the reuse
//!    pool, or appended to the file only when the pool runs dry.
//!
//! The harvest phase is what lets the list recycle its own storage: trunk
//! pages must never be allocated through the tree's page allocator, which
//! would re-enter the free list.
//!
//! ## Ordering
//!
//! `get(topn)` indexes entries newest-first: entry 0 is the most recently
//! freed page. Within a trunk, entries are stored oldest-first, so the top
//! of the list is the last entry of the head trunk.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageType, PAGE_SIZE};

pub const TRUNK_HEADER_SIZE: usize = 20;
pub const TRUNK_MAX_ENTRIES: usize = (PAGE_SIZE - TRUNK_HEADER_SIZE) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TrunkHeader {
    page_type: U16,
    count: U16,
    total: U64,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<TrunkHeader>() == TRUNK_HEADER_SIZE);

/// One page of the free list, owned as a transient buffer. Trunks are
/// copy-on-write like every other page: reads produce a copy, and updates
/// publish whole new images through a [`TrunkStore`].
#[derive(Debug, Clone)]
pub struct TrunkPage {
    data: Vec<u8>,
}

impl TrunkPage {
    pub fn new(count: u16, next: u64) -> Self {
        let mut data = vec![0u8; PAGE_SIZE];
        let header = TrunkHeader {
            page_type: U16::new(PageType::FreeList as u16),
            count: U16::new(count),
            total: U64::new(0),
            next: U64::new(next),
        };
        data[..TRUNK_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Self { data }
    }

    pub fn from_image(data: Vec<u8>) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "trunk image size {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let tag = u16::from_le_bytes(data[0..2].try_into().unwrap());
        ensure!(
            PageType::from_u16(tag) == Some(PageType::FreeList),
            "page is not a free-list trunk (type {:#06x})",
            tag
        );
        Ok(Self { data })
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    pub fn count(&self) -> u16 {
        u16::from_le_bytes(self.data[2..4].try_into().unwrap())
    }

    pub fn total(&self) -> u64 {
        u64::from_le_bytes(self.data[4..12].try_into().unwrap())
    }

    pub fn set_total(&mut self, total: u64) {
        self.data[4..12].copy_from_slice(&total.to_le_bytes());
    }

    pub fn next(&self) -> u64 {
        u64::from_le_bytes(self.data[12..20].try_into().unwrap())
    }

    pub fn entry(&self, idx: usize) -> u64 {
        debug_assert!(idx < self.count() as usize);
        let pos = TRUNK_HEADER_SIZE + 8 * idx;
        u64::from_le_bytes(self.data[pos..pos + 8].try_into().unwrap())
    }

    pub fn set_entry(&mut self, idx: usize, ptr: u64) {
        debug_assert!(idx < self.count() as usize);
        let pos = TRUNK_HEADER_SIZE + 8 * idx;
        self.data[pos..pos + 8].copy_from_slice(&ptr.to_le_bytes());
    }
}

/// Read access to trunk pages.
pub trait TrunkSource {
    fn trunk(&self, ptr: u64) -> Result<TrunkPage>;
}

/// Page placement for the free list. `append` takes a fresh page number at
/// the end of the file; `host` puts a trunk on a page number the list chose
/// itself. Neither goes through the tree's allocator.
pub trait TrunkStore: TrunkSource {
    fn append(&mut self, trunk: TrunkPage) -> u64;
    fn host(&mut self, ptr: u64, trunk: TrunkPage);
}

#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    head: u64,
}

impl FreeList {
    pub fn new(head: u64) -> Self {
        Self { head }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// List-wide entry count, read from the head trunk.
    pub fn total<S: TrunkSource>(&self, store: &S) -> Result<u64> {
        if self.head == 0 {
            return Ok(0);
        }
        Ok(store.trunk(self.head)?.total())
    }

    /// Returns the `topn`-th free page, newest first. `topn` must be below
    /// `total()`.
    pub fn get<S: TrunkSource>(&self, store: &S, mut topn: u64) -> Result<u64> {
        let mut trunk = store.trunk(self.head)?;
        while (trunk.count() as u64) <= topn {
            topn -= trunk.count() as u64;
            let next = trunk.next();
            ensure!(next != 0, "free list underflow at entry {}", topn);
            trunk = store.trunk(next)?;
        }
        Ok(trunk.entry(trunk.count() as usize - topn as usize - 1))
    }

    /// Removes the top `popn` entries and pushes the pages in `freed`, as
    /// one atomic replacement of the list head.
    pub fn update<S: TrunkStore>(
        &mut self,
        store: &mut S,
        mut popn: u64,
        mut freed: Vec<u64>,
    ) -> Result<()> {
        if popn == 0 && freed.is_empty() {
            return Ok(());
        }

        let mut total = self.total(store)?;
        ensure!(
            popn <= total,
            "cannot pop {} entries from a free list of {}",
            popn,
            total
        );

        let mut reuse: Vec<u64> = Vec::new();
        while self.head != 0 && reuse.len() * TRUNK_MAX_ENTRIES < freed.len() {
            let trunk = store.trunk(self.head)?;
            // the trunk page itself is recycled along with its entries
            freed.push(self.head);

            let count = trunk.count() as u64;
            if popn >= count {
                popn -= count;
            } else {
                let mut remain = (count - popn) as usize;
                popn = 0;
                // peel entries for hosting the trunks the push phase builds
                while remain > 0 && reuse.len() * TRUNK_MAX_ENTRIES < freed.len() + remain {
                    remain -= 1;
                    reuse.push(trunk.entry(remain));
                }
                for i in 0..remain {
                    freed.push(trunk.entry(i));
                }
            }

            total -= count;
            self.head = trunk.next();
        }
        ensure!(popn == 0, "free list total disagrees with its chain");

        let new_total = total + freed.len() as u64;
        self.push(store, freed, reuse);

        if self.head != 0 {
            let mut head = store.trunk(self.head)?;
            head.set_total(new_total);
            store.host(self.head, head);
        }

        Ok(())
    }

    fn push<S: TrunkStore>(&mut self, store: &mut S, freed: Vec<u64>, mut reuse: Vec<u64>) {
        let mut rest = freed.as_slice();
        while !rest.is_empty() {
            let size = rest.len().min(TRUNK_MAX_ENTRIES);
            let mut trunk = TrunkPage::new(size as u16, self.head);
            for (i, &ptr) in rest[..size].iter().enumerate() {
                trunk.set_entry(i, ptr);
            }
            rest = &rest[size..];

            if reuse.is_empty() {
                self.head = store.append(trunk);
            } else {
                self.head = reuse.remove(0);
                store.host(self.head, trunk);
            }
        }
        debug_assert!(reuse.is_empty());
    }
}
