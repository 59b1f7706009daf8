//! # Database
//!
//! This module ties the B+tree engine, the free list, and the pager into a
//! single-file key-value store with durable, crash-safe updates.
//!
//! ## Update Buffer
//!
//! A write operation never touches the file directly. The tree's allocation
//! callbacks record everything in an in-memory update set keyed by page
//! number: a fresh page image for an allocation, a tombstone for a release.
//! Page numbers come from the free list first (`nfree` consumed so far this
//! transaction) and from the end of the file after that (`flushed +
//! nappend`). Reads consult the update set before falling back to the
//! mapped file, so a transaction sees its own writes.
//!
//! ## Commit Protocol
//!
//! `set`/`delete` end with one commit:
//!
//! ```text
//! 1. Collect tombstoned page numbers
//! 2. Free-list update: pop the entries consumed, push the freed pages
//!    (may itself buffer trunk pages through the same update set)
//! 3. Extend the file and the mapping to flushed + nappend pages
//! 4. Copy every buffered image into the mapped file
//! 5. fsync                     -- data barrier
//! 6. Advance flushed, clear the buffer
//! 7. Positional write of the master page (sig, root, flushed, free head)
//! 8. fsync                     -- publication barrier
//! ```
//!
//! All data pages written in step 4 are new: their numbers are beyond the
//! previous `flushed` or came off the free list, so nothing reachable from
//! the old master is overwritten. A crash before step 7 leaves the old
//! master naming the old tree; a crash after it leaves the new one. The
//! master write itself is a single small aligned write, which block devices
//! replace atomically.
//!
//! If any step fails, the in-memory state rolls back to the last committed
//! snapshot and the handle stays usable against the old root.
//!
//! ## Concurrency
//!
//! One in-process caller at a time; `&mut self` on the write path is the
//! whole locking story.

use std::collections::HashMap;
use std::path::Path;

use eyre::{ensure, Result};

use crate::btree::{BTree, Node, NodeSource, NodeStore};
use crate::storage::{FreeList, MasterHeader, Pager, TrunkPage, TrunkSource, TrunkStore};

#[derive(Debug)]
pub struct Database {
    pager: Pager,
    tree: BTree,
    freelist: FreeList,
    pages: PageState,
}

#[derive(Debug)]
struct PageState {
    /// One-past-last durable page number; the committed database size.
    flushed: u64,
    /// Free-list entries consumed by this transaction.
    nfree: u64,
    /// Pages appended past `flushed` by this transaction.
    nappend: u64,
    /// Buffered page updates: a new image, or `None` for a released page.
    updates: HashMap<u64, Option<Vec<u8>>>,
}

struct Checkpoint {
    root: u64,
    freelist_head: u64,
    flushed: u64,
}

impl Database {
    /// Opens or creates the database file. A zero-length file is valid and
    /// is initialized lazily: page 0 stays reserved for the master page,
    /// which the first commit writes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pager = Pager::open(path)?;
        let mut db = Self {
            pager,
            tree: BTree::new(0),
            freelist: FreeList::new(0),
            pages: PageState {
                flushed: 1,
                nfree: 0,
                nappend: 0,
                updates: HashMap::new(),
            },
        };
        if db.pager.file_pages() > 0 {
            db.load_master()?;
        }
        Ok(db)
    }

    fn load_master(&mut self) -> Result<()> {
        let page = self.pager.page(0)?;
        let header = MasterHeader::from_bytes(page)?;

        let used = header.page_used();
        ensure!(
            used >= 1 && used <= self.pager.file_pages(),
            "bad master page: {} pages used, file holds {}",
            used,
            self.pager.file_pages()
        );
        ensure!(
            header.root() < used,
            "bad master page: root {} at or beyond page count {}",
            header.root(),
            used
        );

        self.tree = BTree::new(header.root());
        self.freelist = FreeList::new(header.freelist_head());
        self.pages.flushed = used;
        Ok(())
    }

    /// Unmaps the file and closes it. Dropping the handle does the same.
    pub fn close(self) {}

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let view = PageView {
            pager: &self.pager,
            state: &self.pages,
        };
        self.tree.get(&view, key)
    }

    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let checkpoint = self.checkpoint();
        let result = self.set_inner(key, val);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    fn set_inner(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut tree = self.tree;
        {
            let mut txn = Txn {
                pager: &self.pager,
                state: &mut self.pages,
                free: self.freelist,
            };
            tree.insert(&mut txn, key, val)?;
        }
        self.tree = tree;
        self.commit()
    }

    /// Removes `key`, reporting whether it was present. An absent key still
    /// commits (and re-publishes) the unchanged state.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let checkpoint = self.checkpoint();
        let result = self.delete_inner(key);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    fn delete_inner(&mut self, key: &[u8]) -> Result<bool> {
        let mut tree = self.tree;
        let deleted = {
            let mut txn = Txn {
                pager: &self.pager,
                state: &mut self.pages,
                free: self.freelist,
            };
            tree.delete(&mut txn, key)?
        };
        self.tree = tree;
        self.commit()?;
        Ok(deleted)
    }

    /// Committed database size in pages (including the master page).
    pub fn page_count(&self) -> u64 {
        self.pages.flushed
    }

    /// Entries currently on the free list.
    pub fn free_pages(&self) -> Result<u64> {
        let view = PageView {
            pager: &self.pager,
            state: &self.pages,
        };
        self.freelist.total(&view)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            root: self.tree.root(),
            freelist_head: self.freelist.head(),
            flushed: self.pages.flushed,
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.tree = BTree::new(checkpoint.root);
        self.freelist = FreeList::new(checkpoint.freelist_head);
        self.pages.flushed = checkpoint.flushed;
        self.pages.nfree = 0;
        self.pages.nappend = 0;
        self.pages.updates.clear();
    }

    fn commit(&mut self) -> Result<()> {
        let mut freed: Vec<u64> = self
            .pages
            .updates
            .iter()
            .filter_map(|(&ptr, image)| image.is_none().then_some(ptr))
            .collect();
        freed.sort_unstable();

        let popn = self.pages.nfree;
        let mut freelist = self.freelist;
        {
            let mut txn = Txn {
                pager: &self.pager,
                state: &mut self.pages,
                free: self.freelist,
            };
            freelist.update(&mut txn, popn, freed)?;
        }
        self.freelist = freelist;

        let npages = self.pages.flushed + self.pages.nappend;
        self.pager.extend_file(npages)?;
        self.pager.extend_mmap(npages)?;

        for (&ptr, image) in &self.pages.updates {
            if let Some(image) = image {
                self.pager.write_page(ptr, image)?;
            }
        }
        self.pager.sync()?;

        self.pages.flushed += self.pages.nappend;
        self.pages.nfree = 0;
        self.pages.nappend = 0;
        self.pages.updates.clear();

        self.pager
            .write_master(self.tree.root(), self.pages.flushed, self.freelist.head())?;
        self.pager.sync()
    }
}

fn read_page(pager: &Pager, state: &PageState, ptr: u64) -> Result<Vec<u8>> {
    if let Some(entry) = state.updates.get(&ptr) {
        let image = entry
            .as_deref()
            .ok_or_else(|| eyre::eyre!("page {} was released in this transaction", ptr))?;
        return Ok(image.to_vec());
    }
    ensure!(
        ptr < state.flushed,
        "page {} beyond the committed extent {}",
        ptr,
        state.flushed
    );
    Ok(pager.page(ptr)?.to_vec())
}

/// Read-only page access for lookups between transactions.
struct PageView<'a> {
    pager: &'a Pager,
    state: &'a PageState,
}

impl NodeSource for PageView<'_> {
    fn node(&self, ptr: u64) -> Result<Node> {
        Ok(Node::from_image(read_page(self.pager, self.state, ptr)?))
    }
}

impl TrunkSource for PageView<'_> {
    fn trunk(&self, ptr: u64) -> Result<TrunkPage> {
        TrunkPage::from_image(read_page(self.pager, self.state, ptr)?)
    }
}

/// The page store a write transaction runs against: reads see the update
/// buffer first, allocations fill it.
struct Txn<'a> {
    pager: &'a Pager,
    state: &'a mut PageState,
    /// Committed free list, the source of reusable page numbers.
    free: FreeList,
}

impl NodeSource for Txn<'_> {
    fn node(&self, ptr: u64) -> Result<Node> {
        Ok(Node::from_image(read_page(self.pager, self.state, ptr)?))
    }
}

impl NodeStore for Txn<'_> {
    fn allocate(&mut self, node: Node) -> Result<u64> {
        let image = node.into_page_image()?;
        let free = self.free;
        let ptr = if self.state.nfree < free.total(&*self)? {
            // reuse a page freed by an earlier transaction
            let ptr = free.get(&*self, self.state.nfree)?;
            self.state.nfree += 1;
            ptr
        } else {
            let ptr = self.state.flushed + self.state.nappend;
            self.state.nappend += 1;
            ptr
        };
        self.state.updates.insert(ptr, Some(image));
        Ok(ptr)
    }

    fn release(&mut self, ptr: u64) {
        self.state.updates.insert(ptr, None);
    }
}

impl TrunkSource for Txn<'_> {
    fn trunk(&self, ptr: u64) -> Result<TrunkPage> {
        TrunkPage::from_image(read_page(self.pager, self.state, ptr)?)
    }
}

impl TrunkStore for Txn<'_> {
    fn append(&mut self, trunk: TrunkPage) -> u64 {
        let ptr = self.state.flushed + self.state.nappend;
        self.state.nappend += 1;
        self.state.updates.insert(ptr, Some(trunk.into_image()));
        ptr
    }

    fn host(&mut self, ptr: u64, trunk: TrunkPage) {
        self.state.updates.insert(ptr, Some(trunk.into_image()));
    }
}
