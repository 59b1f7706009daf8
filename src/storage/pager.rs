//! # Memory-Mapped Pager
//!
//! This module implements `Pager`, the single-file paging layer beneath the
//! B+tree. It maps the database file into memory in growing chunks and
//! translates page numbers into 4KB slices.
//!
//! ## Chunked Mapping
//!
//! Remapping a file invalidates every outstanding pointer into the old
//! mapping. Instead of remapping on growth, the pager keeps an ordered list
//! of mappings, each one covering the region after the previous ones and
//! doubling the total coverage:
//!
//! ```text
//! chunk 0: [0, 64MiB)            initial mapping
//! chunk 1: [64MiB, 128MiB)       first growth
//! chunk 2: [128MiB, 256MiB)      second growth
//! ```
//!
//! Existing chunks are never moved or unmapped until close, so page slices
//! handed out earlier in a transaction stay valid while the file grows.
//!
//! ## Coverage Invariants
//!
//! Three extents are tracked, each allowed to run ahead of the previous:
//!
//! - the logical database (`page_used` pages, owned by the caller),
//! - the file, pre-extended exponentially so growth is O(log n) truncate
//!   calls over the database lifetime,
//! - the mapped region, which may exceed the file (touching pages beyond
//!   EOF is the caller's bug; the pager only hands out slices the caller
//!   asked to cover).
//!
//! ## Durability
//!
//! `sync` issues an fsync on the file descriptor, which flushes dirty pages
//! written through the shared mapping. `write_master` bypasses the mapping
//! entirely and uses a positional write, because an mmap store is not atomic
//! with respect to power loss while a single small aligned `write` is.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use zerocopy::IntoBytes;

use super::{MasterHeader, PAGE_SIZE};

const INITIAL_MMAP_SIZE: usize = 64 << 20;

#[derive(Debug)]
pub struct Pager {
    file: File,
    file_size: u64,
    mapped: usize,
    chunks: Vec<MmapMut>,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_map_size(path, INITIAL_MMAP_SIZE)
    }

    fn open_with_map_size<P: AsRef<Path>>(path: P, min_map_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mut map_size = min_map_size;
        while (map_size as u64) < file_size {
            map_size *= 2;
        }

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally, leading to undefined behavior. This is safe
        // because:
        // 1. The file is opened read+write and database files are not meant
        //    to be touched by external processes
        // 2. The mapping may extend past EOF; page() only resolves page
        //    numbers the caller has extended the file to cover
        // 3. The mmap lifetime is tied to Pager, preventing use-after-unmap
        let chunk = unsafe {
            MmapOptions::new()
                .len(map_size)
                .map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            file_size,
            mapped: map_size,
            chunks: vec![chunk],
        })
    }

    pub fn file_pages(&self) -> u64 {
        self.file_size / PAGE_SIZE as u64
    }

    /// Grows the file to cover at least `npages` pages. The size is
    /// increased exponentially so the file is not extended on every commit.
    pub fn extend_file(&mut self, npages: u64) -> Result<()> {
        let mut file_pages = self.file_pages();
        if file_pages >= npages {
            return Ok(());
        }

        while file_pages < npages {
            let inc = std::cmp::max(1, file_pages / 8);
            file_pages += inc;
        }

        let file_size = file_pages * PAGE_SIZE as u64;
        self.file
            .set_len(file_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", file_size))?;
        self.file_size = file_size;

        Ok(())
    }

    /// Grows the mapped region to cover at least `npages` pages by appending
    /// chunks, doubling the coverage each time. Existing chunks stay put.
    pub fn extend_mmap(&mut self, npages: u64) -> Result<()> {
        while (self.mapped as u64) < npages * PAGE_SIZE as u64 {
            // SAFETY: the new chunk maps the region [mapped, 2*mapped),
            // disjoint from every existing chunk. Safety otherwise follows
            // the initial mapping: exclusive in-process access, lifetime
            // tied to Pager.
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.mapped as u64)
                    .len(self.mapped)
                    .map_mut(&self.file)
                    .wrap_err("failed to map additional chunk")?
            };
            self.chunks.push(chunk);
            self.mapped *= 2;
        }
        Ok(())
    }

    pub fn page(&self, ptr: u64) -> Result<&[u8]> {
        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                let offset = (ptr - start) as usize * PAGE_SIZE;
                return Ok(&chunk[offset..offset + PAGE_SIZE]);
            }
            start = end;
        }
        bail!("page {} beyond mapped region ({} pages)", ptr, start)
    }

    pub fn page_mut(&mut self, ptr: u64) -> Result<&mut [u8]> {
        let mut start = 0u64;
        for chunk in &mut self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                let offset = (ptr - start) as usize * PAGE_SIZE;
                return Ok(&mut chunk[offset..offset + PAGE_SIZE]);
            }
            start = end;
        }
        bail!("page {} beyond mapped region ({} pages)", ptr, start)
    }

    pub fn write_page(&mut self, ptr: u64, image: &[u8]) -> Result<()> {
        ensure!(
            image.len() == PAGE_SIZE,
            "page image size {} != {}",
            image.len(),
            PAGE_SIZE
        );
        self.page_mut(ptr)?.copy_from_slice(image);
        Ok(())
    }

    /// Durability barrier: everything written so far (through the mapping or
    /// otherwise) reaches stable storage before this returns.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("fsync failed")
    }

    /// Publishes a new master tuple with a single positional write at
    /// offset 0, never through the mapping.
    pub fn write_master(&self, root: u64, page_used: u64, freelist_head: u64) -> Result<()> {
        let header = MasterHeader::new(root, page_used, freelist_head);
        self.file
            .write_all_at(header.as_bytes(), 0)
            .wrap_err("failed to write master page")
    }
}
