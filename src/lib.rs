//! # shadowdb - Embedded Copy-on-Write Key-Value Store
//!
//! shadowdb is an embedded, single-file, persistent key-value store. Its
//! core is a copy-on-write B+tree on fixed-size 4KB pages, paired with an
//! on-disk free list and a memory-mapped pager, publishing every update by
//! atomically rewriting a single master page.
//!
//! ## Quick Start
//!
//! ```ignore
//! use shadowdb::Database;
//!
//! let mut db = Database::open("./data.db")?;
//! db.set(b"greeting", b"hello")?;
//! assert_eq!(db.get(b"greeting")?, Some(b"hello".to_vec()));
//! db.delete(b"greeting")?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Database)        │
//! ├─────────────────────────────────────┤
//! │   Commit (update buffer, master)    │
//! ├──────────────────┬──────────────────┤
//! │  B+Tree Engine   │    Free List     │
//! ├──────────────────┴──────────────────┤
//! │     Pager (chunked mmap, fsync)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! Pages are immutable once published. A write builds new page images in a
//! buffered update set, the free list recycles superseded page numbers, and
//! the pager flushes everything before a positional write of the master
//! page makes the new tree root visible. A crash at any point leaves the
//! previous committed state readable.
//!
//! ## Module Overview
//!
//! - [`btree`]: the copy-on-write tree engine and its page-store traits
//! - [`storage`]: pager, free list, master-page header, page constants
//!
//! ## Limits
//!
//! Keys are 1 to 1000 bytes, values up to 3000 bytes, so that any single
//! pair fits a page. One writer at a time; readers see the last committed
//! state.

pub mod btree;
pub mod storage;

mod database;

pub use database::Database;
pub use storage::{MAX_KEY_SIZE, MAX_VAL_SIZE, PAGE_SIZE};
