//! # Master Page Header
//!
//! Page 0 of the database file is the master page. Its first 40 bytes name
//! the current database state; everything reachable from this tuple is the
//! committed database, everything else in the file is garbage that the free
//! list may hand out again.
//!
//! ## Layout (40 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       16    magic          ASCII format signature
//! 16      8     root           Tree root page number (0 = empty tree)
//! 24      8     page_used      One-past-last durable page number
//! 32      8     freelist_head  Head trunk page number (0 = empty list)
//! ```
//!
//! The remaining bytes of page 0 are unused and may be zero.
//!
//! ## Atomicity
//!
//! The master page is the only page ever rewritten in place. It is written
//! with a single positional `write` of these 40 bytes (never through the
//! mmap), so on typical block devices the update is atomic with respect to
//! power loss: a reopened file sees either the old tuple or the new one.
//!
//! ## Zerocopy Safety
//!
//! The header uses zerocopy traits (`FromBytes`, `IntoBytes`, `Unaligned`)
//! so it can be parsed directly from the mapped page without copying, with
//! compile-time size verification.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const FILE_MAGIC: &[u8; 16] = b"BuildYourOwnDB05";
pub const MASTER_HEADER_SIZE: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterHeader {
    magic: [u8; 16],
    root: U64,
    page_used: U64,
    freelist_head: U64,
}

const _: () = assert!(std::mem::size_of::<MasterHeader>() == MASTER_HEADER_SIZE);

impl MasterHeader {
    pub fn new(root: u64, page_used: u64, freelist_head: u64) -> Self {
        Self {
            magic: *FILE_MAGIC,
            root: U64::new(root),
            page_used: U64::new(page_used),
            freelist_head: U64::new(freelist_head),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= MASTER_HEADER_SIZE,
            "buffer too small for MasterHeader: {} < {}",
            bytes.len(),
            MASTER_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..MASTER_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MasterHeader: {:?}", e))?;

        ensure!(&header.magic == FILE_MAGIC, "bad file signature");

        Ok(header)
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn page_used(&self) -> u64 {
        self.page_used.get()
    }

    pub fn freelist_head(&self) -> u64 {
        self.freelist_head.get()
    }
}
