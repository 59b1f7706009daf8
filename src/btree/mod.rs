//! # B+Tree Engine
//!
//! This module implements the copy-on-write B+tree at the core of shadowdb.
//! The tree never edits a page in place: every insert or delete rebuilds the
//! path from the affected leaf to the root as fresh page images, releases
//! the superseded pages, and yields a new root pointer. Readers holding the
//! old root keep a consistent tree for free.
//!
//! ## Page Store Abstraction
//!
//! The engine knows nothing about files. It runs against two traits:
//!
//! - [`NodeSource`]: dereference a page number into a node image
//! - [`NodeStore`]: additionally allocate a page for a new image and
//!   release a superseded one
//!
//! The database provides an mmap-backed implementation whose allocations go
//! through a buffered update set; the tests here run against a plain
//! hash-map store. Neither changes the algorithms.
//!
//! ## Insert
//!
//! ```text
//! 1. Descend to the leaf via lookup_le, releasing each visited page
//! 2. Rebuild the leaf with the key inserted (or its value replaced)
//! 3. Split the rebuilt node into 1-3 page-sized pieces
//! 4. Rebuild the parent with the pieces in place of the old child,
//!    keyed by each piece's first key; repeat up to the root
//! 5. If the root itself split, add a new interior root over the pieces
//! ```
//!
//! An empty tree bootstraps as a two-entry leaf: the empty sentinel key
//! plus the inserted pair. The sentinel makes `lookup_le` total, so no
//! descent can fall off the left edge of the key space.
//!
//! ## Delete
//!
//! Deletion rebuilds the leaf without the key, then walks back up deciding
//! per level whether the shrunken child should merge with a neighbor. A
//! child merges when it occupies less than a quarter page and the combined
//! node fits in one page. A root interior node left with a single key is
//! collapsed, shrinking the tree by one level.
//!
//! ## Split Sizing
//!
//! `node_split2` pushes the split point as far left as the right half
//! allows; the left half may still overflow one page, in which case it is
//! split once more. Three pieces always suffice because a rebuild grows a
//! node by at most one maximum-size record, which keeps it under two pages.

mod node;

pub use node::Node;

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use crate::storage::{PageType, MAX_KEY_SIZE, MAX_VAL_SIZE, NODE_HEADER_SIZE, PAGE_SIZE};

/// Read access to published pages.
pub trait NodeSource {
    fn node(&self, ptr: u64) -> Result<Node>;
}

/// Page lifecycle for tree rebuilds. `allocate` assigns a page number to a
/// finished image; `release` marks a superseded page reclaimable. Released
/// pages must stay readable until the end of the current operation.
pub trait NodeStore: NodeSource {
    fn allocate(&mut self, node: Node) -> Result<u64>;
    fn release(&mut self, ptr: u64);
}

type Split = SmallVec<[Node; 3]>;

#[derive(Debug, Clone, Copy)]
pub struct BTree {
    root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn get<S: NodeSource>(&self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );

        if self.root == 0 {
            return Ok(None);
        }
        let root = store.node(self.root)?;
        tree_get(store, &root, key)
    }

    pub fn insert<S: NodeStore>(&mut self, store: &mut S, key: &[u8], val: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            val.len() <= MAX_VAL_SIZE,
            "value length {} exceeds maximum {}",
            val.len(),
            MAX_VAL_SIZE
        );

        if self.root == 0 {
            // Bootstrap: a leaf holding the empty sentinel plus the new
            // pair, covering the whole key space from the start.
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(PageType::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = store.allocate(root)?;
            return Ok(());
        }

        let old_root = store.node(self.root)?;
        store.release(self.root);
        let rebuilt = tree_insert(store, &old_root, key, val)?;
        let mut split = node_split3(rebuilt)?;

        if split.len() == 1 {
            let only = split.remove(0);
            self.root = store.allocate(only)?;
        } else {
            // the root split; grow the tree by one level
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(PageType::Interior, split.len() as u16);
            for (i, piece) in split.into_iter().enumerate() {
                let first_key = piece.key(0).to_vec();
                let ptr = store.allocate(piece)?;
                root.append_kv(i as u16, ptr, &first_key, b"");
            }
            self.root = store.allocate(root)?;
        }
        Ok(())
    }

    pub fn delete<S: NodeStore>(&mut self, store: &mut S, key: &[u8]) -> Result<bool> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );

        if self.root == 0 {
            return Ok(false);
        }

        let old_root = store.node(self.root)?;
        let Some(updated) = tree_delete(store, &old_root, key)? else {
            return Ok(false);
        };

        store.release(self.root);
        if updated.page_type()? == PageType::Interior && updated.nkeys() == 1 {
            // the root carries a single child; drop a level
            self.root = updated.ptr(0);
        } else {
            self.root = store.allocate(updated)?;
        }
        Ok(true)
    }
}

fn tree_get<S: NodeSource>(store: &S, node: &Node, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let idx = node.lookup_le(key);
    match node.page_type()? {
        PageType::Leaf => Ok((node.key(idx) == key).then(|| node.value(idx).to_vec())),
        PageType::Interior => {
            let child = store.node(node.ptr(idx))?;
            tree_get(store, &child, key)
        }
        PageType::FreeList => bail!("free-list trunk reached during lookup"),
    }
}

/// Rebuilds `node` with `key` inserted or updated. The result may overflow
/// one page; the caller splits it.
fn tree_insert<S: NodeStore>(store: &mut S, node: &Node, key: &[u8], val: &[u8]) -> Result<Node> {
    let mut new = Node::new(2 * PAGE_SIZE);
    let idx = node.lookup_le(key);
    match node.page_type()? {
        PageType::Leaf => {
            if node.key(idx) == key {
                leaf_update(&mut new, node, idx, key, val);
            } else {
                leaf_insert(&mut new, node, idx + 1, key, val);
            }
        }
        PageType::Interior => {
            node_insert(store, &mut new, node, idx, key, val)?;
        }
        PageType::FreeList => bail!("free-list trunk reached during insert"),
    }
    Ok(new)
}

/// Interior step of insert: rebuild the child at `idx`, split the result,
/// and rebuild this node around the pieces.
fn node_insert<S: NodeStore>(
    store: &mut S,
    new: &mut Node,
    node: &Node,
    idx: u16,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    let kptr = node.ptr(idx);
    let child = store.node(kptr)?;
    store.release(kptr);
    let rebuilt = tree_insert(store, &child, key, val)?;
    let split = node_split3(rebuilt)?;
    node_replace_kid_n(store, new, node, idx, split)
}

fn leaf_insert(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(PageType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(PageType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - (idx + 1));
}

fn leaf_delete(new: &mut Node, old: &Node, idx: u16) {
    new.set_header(PageType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

/// Size in bytes of the node formed by records `[idx, nkeys)`.
fn tail_size(node: &Node, idx: u16) -> usize {
    NODE_HEADER_SIZE
        + 10 * (node.nkeys() - idx) as usize
        + (node.offset(node.nkeys()) - node.offset(idx)) as usize
}

/// Splits an oversized node in two, pushing the boundary as far left as the
/// right half allows. The left half may still exceed one page.
fn node_split2(left: &mut Node, right: &mut Node, old: &Node) -> Result<()> {
    let nkeys = old.nkeys();
    ensure!(nkeys >= 2, "cannot split a {}-key node", nkeys);

    let mut split = nkeys - 1;
    while split > 1 && tail_size(old, split - 1) <= PAGE_SIZE {
        split -= 1;
    }
    ensure!(
        tail_size(old, split) <= PAGE_SIZE,
        "no split point leaves the right half within a page"
    );

    let page_type = old.page_type()?;
    left.set_header(page_type, split);
    left.append_range(old, 0, 0, split);
    right.set_header(page_type, nkeys - split);
    right.append_range(old, 0, split, nkeys - split);
    Ok(())
}

/// Splits a rebuilt node into 1-3 page-sized pieces.
fn node_split3(node: Node) -> Result<Split> {
    if node.nbytes() <= PAGE_SIZE {
        return Ok(smallvec![node]);
    }

    let mut left = Node::new(2 * PAGE_SIZE);
    let mut right = Node::new(PAGE_SIZE);
    node_split2(&mut left, &mut right, &node)?;
    if left.nbytes() <= PAGE_SIZE {
        return Ok(smallvec![left, right]);
    }

    let mut leftleft = Node::new(PAGE_SIZE);
    let mut middle = Node::new(PAGE_SIZE);
    node_split2(&mut leftleft, &mut middle, &left)?;
    Ok(smallvec![leftleft, middle, right])
}

/// Rebuilds an interior node with the child at `idx` replaced by `kids`,
/// each keyed by its first key.
fn node_replace_kid_n<S: NodeStore>(
    store: &mut S,
    new: &mut Node,
    old: &Node,
    idx: u16,
    kids: Split,
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(PageType::Interior, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.into_iter().enumerate() {
        let first_key = kid.key(0).to_vec();
        let ptr = store.allocate(kid)?;
        new.append_kv(idx + i as u16, ptr, &first_key, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(())
}

/// Rebuilds an interior node with the adjacent children at `idx` and
/// `idx + 1` collapsed into the single merged child.
fn node_replace_2_kid(new: &mut Node, old: &Node, idx: u16, merged_ptr: u64, key: &[u8]) {
    new.set_header(PageType::Interior, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, merged_ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

fn node_merge(new: &mut Node, left: &Node, right: &Node) -> Result<()> {
    new.set_header(left.page_type()?, left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    Ok(())
}

enum MergeSide {
    Left(Node),
    Right(Node),
    Keep,
}

/// Decides whether a shrunken child should merge with a neighbor: only when
/// it occupies under a quarter page and the combined node fits in one page.
fn should_merge<S: NodeSource>(
    store: &S,
    node: &Node,
    idx: u16,
    updated: &Node,
) -> Result<MergeSide> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(MergeSide::Keep);
    }

    if idx > 0 {
        let sibling = store.node(node.ptr(idx - 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            return Ok(MergeSide::Left(sibling));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = store.node(node.ptr(idx + 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            return Ok(MergeSide::Right(sibling));
        }
    }
    Ok(MergeSide::Keep)
}

/// Rebuilds `node` with `key` removed from its subtree. `None` means the
/// key was not found and nothing changed.
fn tree_delete<S: NodeStore>(store: &mut S, node: &Node, key: &[u8]) -> Result<Option<Node>> {
    let idx = node.lookup_le(key);
    match node.page_type()? {
        PageType::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut new = Node::new(2 * PAGE_SIZE);
            leaf_delete(&mut new, node, idx);
            Ok(Some(new))
        }
        PageType::Interior => node_delete(store, node, idx, key),
        PageType::FreeList => bail!("free-list trunk reached during delete"),
    }
}

/// Interior step of delete: rebuild the child at `idx` without the key,
/// then either merge it with a neighbor or keep it in place.
fn node_delete<S: NodeStore>(
    store: &mut S,
    node: &Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<Node>> {
    let kptr = node.ptr(idx);
    let child = store.node(kptr)?;
    let Some(updated) = tree_delete(store, &child, key)? else {
        return Ok(None);
    };
    store.release(kptr);

    let mut new = Node::new(2 * PAGE_SIZE);
    match should_merge(store, node, idx, &updated)? {
        MergeSide::Left(sibling) => {
            let mut merged = Node::new(PAGE_SIZE);
            node_merge(&mut merged, &sibling, &updated)?;
            store.release(node.ptr(idx - 1));
            let first_key = merged.key(0).to_vec();
            let merged_ptr = store.allocate(merged)?;
            node_replace_2_kid(&mut new, node, idx - 1, merged_ptr, &first_key);
        }
        MergeSide::Right(sibling) => {
            let mut merged = Node::new(PAGE_SIZE);
            node_merge(&mut merged, &updated, &sibling)?;
            store.release(node.ptr(idx + 1));
            let first_key = merged.key(0).to_vec();
            let merged_ptr = store.allocate(merged)?;
            node_replace_2_kid(&mut new, node, idx, merged_ptr, &first_key);
        }
        MergeSide::Keep => {
            if updated.nkeys() == 0 {
                // the child emptied out with no neighbor to absorb it; this
                // node shrinks to an empty interior and is merged higher up
                ensure!(
                    node.nkeys() == 1 && idx == 0,
                    "empty child left beside unmerged siblings"
                );
                new.set_header(PageType::Interior, 0);
            } else {
                node_replace_kid_n(store, &mut new, node, idx, smallvec![updated])?;
            }
        }
    }
    Ok(Some(new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn get_on_empty_tree_finds_nothing() {
        let store = MemStore::new();
        let tree = BTree::new(0);

        assert_eq!(tree.get(&store, b"a").unwrap(), None);
    }

    #[test]
    fn first_insert_bootstraps_a_sentinel_leaf() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        tree.insert(&mut store, b"a", b"a1").unwrap();

        let root = store.node(tree.root()).unwrap();
        assert_eq!(root.page_type().unwrap(), PageType::Leaf);
        assert_eq!(root.nkeys(), 2);
        assert_eq!(root.key(0), b"");
        assert_eq!(root.key(1), b"a");
        assert_eq!(tree.get(&store, b"a").unwrap(), Some(b"a1".to_vec()));
    }

    #[test]
    fn insert_overwrites_existing_value() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        tree.insert(&mut store, b"k", b"v1").unwrap();
        tree.insert(&mut store, b"k", b"v2").unwrap();

        assert_eq!(tree.get(&store, b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn inserts_survive_splits() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);
        let value = vec![0x5Au8; 100];

        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            tree.insert(&mut store, key.as_bytes(), &value).unwrap();
        }

        let root = store.node(tree.root()).unwrap();
        assert_eq!(root.page_type().unwrap(), PageType::Interior);
        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            assert_eq!(
                tree.get(&store, key.as_bytes()).unwrap(),
                Some(value.clone()),
                "key {} lost",
                key
            );
        }
        assert_eq!(tree.get(&store, b"key99999").unwrap(), None);
    }

    #[test]
    fn reverse_insertion_order_stays_sorted() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        for i in (0..300u32).rev() {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            tree.insert(&mut store, key.as_bytes(), val.as_bytes())
                .unwrap();
        }

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            assert_eq!(
                tree.get(&store, key.as_bytes()).unwrap(),
                Some(val.into_bytes())
            );
        }
        assert_node_invariants(&store, tree.root());
    }

    #[test]
    fn root_split_arity_matches_piece_count() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);
        let big_val = vec![1u8; MAX_VAL_SIZE];

        tree.insert(&mut store, &[b'a'; MAX_KEY_SIZE], &big_val).unwrap();
        tree.insert(&mut store, &[b'b'; MAX_KEY_SIZE], &big_val).unwrap();

        let root = store.node(tree.root()).unwrap();
        assert_eq!(root.page_type().unwrap(), PageType::Interior);
        assert!(root.nkeys() == 2 || root.nkeys() == 3);
    }

    #[test]
    fn max_size_pair_roundtrips() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);
        let key = vec![0x61u8; MAX_KEY_SIZE];
        let val = vec![0x62u8; MAX_VAL_SIZE];

        tree.insert(&mut store, &key, &val).unwrap();

        assert_eq!(tree.get(&store, &key).unwrap(), Some(val));
    }

    #[test]
    fn oversize_key_and_value_are_rejected() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        assert!(tree.insert(&mut store, b"", b"v").is_err());
        assert!(tree
            .insert(&mut store, &vec![0u8; MAX_KEY_SIZE + 1], b"v")
            .is_err());
        assert!(tree
            .insert(&mut store, b"k", &vec![0u8; MAX_VAL_SIZE + 1])
            .is_err());
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);
        tree.insert(&mut store, b"k", b"v").unwrap();

        assert!(!tree.delete(&mut store, b"other").unwrap());
        assert!(!BTree::new(0).delete(&mut store, b"k").unwrap());
    }

    #[test]
    fn delete_merges_back_to_a_single_leaf() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        for i in 0..400u32 {
            let key = format!("key{:05}", i);
            tree.insert(&mut store, key.as_bytes(), b"x").unwrap();
        }
        for i in 0..400u32 {
            let key = format!("key{:05}", i);
            assert!(tree.delete(&mut store, key.as_bytes()).unwrap());
        }

        let root = store.node(tree.root()).unwrap();
        assert_eq!(root.page_type().unwrap(), PageType::Leaf);
        assert_eq!(root.nkeys(), 1);
        assert_eq!(root.key(0), b"");
    }

    #[test]
    fn interleaved_deletes_keep_survivors_readable() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            tree.insert(&mut store, key.as_bytes(), val.as_bytes())
                .unwrap();
        }
        for i in (0..300u32).step_by(3) {
            let key = format!("key{:05}", i);
            assert!(tree.delete(&mut store, key.as_bytes()).unwrap());
        }

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let got = tree.get(&store, key.as_bytes()).unwrap();
            if i % 3 == 0 {
                assert_eq!(got, None, "key {} should be gone", key);
            } else {
                let val = format!("val{:05}", i);
                assert_eq!(got, Some(val.into_bytes()), "key {} lost", key);
            }
        }
        assert_node_invariants(&store, tree.root());
    }

    #[test]
    fn copy_on_write_releases_every_superseded_page() {
        let mut store = MemStore::new();
        let mut tree = BTree::new(0);

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            tree.insert(&mut store, key.as_bytes(), b"payload").unwrap();
        }
        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            tree.delete(&mut store, key.as_bytes()).unwrap();
        }

        // eager release in MemStore means leftover pages would be leaks
        assert_eq!(store.pages.len(), 1, "only the root leaf should survive");
    }

    #[test]
    fn emptied_single_child_branch_collapses() {
        let mut store = MemStore::new();

        // handcraft: root -> [leaf0, mid] where mid is an interior node
        // with a single leaf child
        let mut leaf0 = Node::new(PAGE_SIZE);
        leaf0.set_header(PageType::Leaf, 2);
        leaf0.append_kv(0, 0, b"", b"");
        leaf0.append_kv(1, 0, b"a", b"1");
        let leaf0_ptr = store.allocate(leaf0).unwrap();

        let mut leaf1 = Node::new(PAGE_SIZE);
        leaf1.set_header(PageType::Leaf, 1);
        leaf1.append_kv(0, 0, b"m", b"2");
        let leaf1_ptr = store.allocate(leaf1).unwrap();

        let mut mid = Node::new(PAGE_SIZE);
        mid.set_header(PageType::Interior, 1);
        mid.append_kv(0, leaf1_ptr, b"m", b"");
        let mid_ptr = store.allocate(mid).unwrap();

        let mut root = Node::new(PAGE_SIZE);
        root.set_header(PageType::Interior, 2);
        root.append_kv(0, leaf0_ptr, b"", b"");
        root.append_kv(1, mid_ptr, b"m", b"");
        let root_ptr = store.allocate(root).unwrap();

        let mut tree = BTree::new(root_ptr);
        assert!(tree.delete(&mut store, b"m").unwrap());

        assert_eq!(tree.get(&store, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(&store, b"m").unwrap(), None);
        let root = store.node(tree.root()).unwrap();
        assert_eq!(root.page_type().unwrap(), PageType::Leaf);
    }

    #[test]
    fn split3_pieces_fit_and_preserve_order() {
        let mut node = Node::new(2 * PAGE_SIZE);
        let count = 100u16;
        node.set_header(PageType::Leaf, count);
        node.append_kv(0, 0, b"", b"");
        for i in 1..count {
            let key = format!("key{:05}", i);
            node.append_kv(i, 0, key.as_bytes(), &[0u8; 50]);
        }
        assert!(node.nbytes() > PAGE_SIZE);

        let pieces = node_split3(node).unwrap();

        assert!(pieces.len() >= 2 && pieces.len() <= 3);
        let mut rebuilt: Vec<Vec<u8>> = Vec::new();
        for piece in &pieces {
            assert!(piece.nbytes() <= PAGE_SIZE);
            assert!(piece.nkeys() >= 1);
            for i in 0..piece.nkeys() {
                rebuilt.push(piece.key(i).to_vec());
            }
        }
        assert_eq!(rebuilt.len(), count as usize);
        assert!(windows_sorted(&rebuilt[1..]));
    }

    fn windows_sorted(keys: &[Vec<u8>]) -> bool {
        keys.windows(2).all(|w| w[0] < w[1])
    }

    /// Walks the subtree checking size, order, and separator invariants.
    fn assert_node_invariants(store: &MemStore, ptr: u64) {
        let node = store.node(ptr).unwrap();
        assert!(node.nbytes() <= PAGE_SIZE);
        assert!(node.nkeys() >= 1);
        for i in 1..node.nkeys().saturating_sub(1) {
            assert!(node.key(i) < node.key(i + 1), "keys out of order");
        }
        if node.page_type().unwrap() == PageType::Interior {
            for i in 0..node.nkeys() {
                let child = store.node(node.ptr(i)).unwrap();
                assert_eq!(child.key(0), node.key(i), "separator drift at slot {}", i);
                assert_node_invariants(store, node.ptr(i));
            }
        }
    }

    struct MemStore {
        pages: HashMap<u64, Vec<u8>>,
        next_ptr: u64,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                next_ptr: 1,
            }
        }
    }

    impl NodeSource for MemStore {
        fn node(&self, ptr: u64) -> Result<Node> {
            let data = self
                .pages
                .get(&ptr)
                .ok_or_else(|| eyre::eyre!("unknown page {}", ptr))?;
            Ok(Node::from_image(data.clone()))
        }
    }

    impl NodeStore for MemStore {
        fn allocate(&mut self, node: Node) -> Result<u64> {
            let ptr = self.next_ptr;
            self.next_ptr += 1;
            self.pages.insert(ptr, node.into_page_image()?);
            Ok(ptr)
        }

        fn release(&mut self, ptr: u64) {
            self.pages.remove(&ptr);
        }
    }
}
