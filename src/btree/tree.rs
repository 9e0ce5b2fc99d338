//! # Tree Operations
//!
//! Insert, delete and point lookup over the copy-on-write node layout.
//!
//! Mutations never touch an existing page. The recursion fetches a node,
//! deallocates it, and rebuilds its replacement in a scratch buffer that may
//! run to two pages; [`node_split3`] then cuts the result back to at most
//! three page-sized nodes, whose first keys become the parent's routing
//! keys. Deletion merges a shrunken child (a quarter page or less) into a
//! sibling when the pair fits in one page, preferring the left sibling, and
//! collapses the root when an internal root is left with a single child.

use eyre::Result;
use smallvec::{smallvec, SmallVec};

use super::node::{Node, NodeType, MAX_KEY_SIZE, MAX_VAL_SIZE, NODE_HEADER};
use super::{PageRead, PageStore};
use crate::storage::PAGE_SIZE;

/// A persistent ordered map. Holds only the root page number; all page
/// access goes through the store passed to each operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BTree {
    pub root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn get<P: PageRead>(&self, store: &P, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut node = store.page(self.root)?;
        loop {
            let idx = lookup_le(&node, key);
            match node.btype() {
                NodeType::Leaf => {
                    return Ok((node.key(idx) == key).then(|| node.val(idx).to_vec()));
                }
                NodeType::Internal => {
                    node = store.page(node.ptr(idx))?;
                }
                NodeType::FreeList => panic!("free-list page reached from the tree"),
            }
        }
    }

    pub fn insert<S: PageStore>(&mut self, store: &mut S, key: &[u8], val: &[u8]) -> Result<()> {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key exceeds {MAX_KEY_SIZE} bytes");
        assert!(val.len() <= MAX_VAL_SIZE, "value exceeds {MAX_VAL_SIZE} bytes");

        if self.root == 0 {
            // First root. The sentinel slot keeps every possible key inside
            // the range of some leaf, so descents never fall off the left edge.
            let mut root = Node::new();
            root.set_header(NodeType::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = store.alloc(root)?;
            return Ok(());
        }

        let node = store.page(self.root)?;
        store.dealloc(self.root);
        let node = tree_insert(store, node, key, val)?;
        let mut split = node_split3(node);
        if split.len() > 1 {
            // The root itself split: grow the tree by one level.
            let mut root = Node::new();
            root.set_header(NodeType::Internal, split.len() as u16);
            for (i, child) in split.drain(..).enumerate() {
                let first = child.key(0).to_vec();
                let ptr = store.alloc(child)?;
                root.append_kv(i as u16, ptr, &first, b"");
            }
            self.root = store.alloc(root)?;
        } else {
            self.root = store.alloc(split.pop().unwrap())?;
        }
        Ok(())
    }

    /// Removes `key`. Returns false (leaving every page untouched) if the
    /// key is absent.
    pub fn delete<S: PageStore>(&mut self, store: &mut S, key: &[u8]) -> Result<bool> {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key exceeds {MAX_KEY_SIZE} bytes");

        if self.root == 0 {
            return Ok(false);
        }
        let root = store.page(self.root)?;
        let Some(updated) = tree_delete(store, root, key)? else {
            return Ok(false);
        };

        store.dealloc(self.root);
        if updated.btype() == NodeType::Internal && updated.nkeys() == 1 {
            // Remove a level.
            self.root = updated.ptr(0);
        } else {
            self.root = store.alloc(updated)?;
        }
        Ok(true)
    }
}

/// Greatest slot whose key is <= `key`. Slot 0 is the routing-key copy from
/// the parent and compares <= every key routed here, so the search runs over
/// slots 1..nkeys.
pub(crate) fn lookup_le(node: &Node, key: &[u8]) -> u16 {
    let nkeys = node.nkeys();
    let mut lo: u16 = 1;
    let mut hi: u16 = nkeys;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if node.key(mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo - 1
}

fn tree_insert<S: PageStore>(store: &mut S, node: Node, key: &[u8], val: &[u8]) -> Result<Node> {
    // The replacement may overflow one page; the caller splits it.
    let mut new = Node::scratch();
    let idx = lookup_le(&node, key);
    match node.btype() {
        NodeType::Leaf => {
            if node.key(idx) == key {
                leaf_update(&mut new, &node, idx, key, val);
            } else {
                leaf_insert(&mut new, &node, idx + 1, key, val);
            }
        }
        NodeType::Internal => node_insert(store, &mut new, &node, idx, key, val)?,
        NodeType::FreeList => panic!("free-list page reached from the tree"),
    }
    Ok(new)
}

fn leaf_insert(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - (idx + 1));
}

fn leaf_delete(new: &mut Node, old: &Node, idx: u16) {
    new.set_header(NodeType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

fn node_insert<S: PageStore>(
    store: &mut S,
    new: &mut Node,
    node: &Node,
    idx: u16,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    let kptr = node.ptr(idx);
    let knode = store.page(kptr)?;
    store.dealloc(kptr);
    let knode = tree_insert(store, knode, key, val)?;
    let split = node_split3(knode);
    node_replace_kid_n(store, new, node, idx, split)
}

/// Replaces the child at `idx` with 1..=3 new children, each routed by its
/// own first key.
fn node_replace_kid_n<S: PageStore>(
    store: &mut S,
    new: &mut Node,
    old: &Node,
    idx: u16,
    kids: SmallVec<[Node; 3]>,
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.into_iter().enumerate() {
        let first = kid.key(0).to_vec();
        let ptr = store.alloc(kid)?;
        new.append_kv(idx + i as u16, ptr, &first, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(())
}

fn node_replace_2kid(new: &mut Node, old: &Node, idx: u16, merged_ptr: u64, merged_key: &[u8]) {
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, merged_ptr, merged_key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

fn subrange_bytes(node: &Node, from: u16, to: u16) -> usize {
    NODE_HEADER
        + 10 * (to - from) as usize
        + (node.offset(to) - node.offset(from)) as usize
}

/// Splits `old` in two by key count. The split point starts at the midpoint
/// and moves right until the tail half fits in one page; the head half may
/// still overflow and is re-split by the caller.
fn node_split2(left: &mut Node, right: &mut Node, old: &Node) {
    let nkeys = old.nkeys();
    let mut nleft = (nkeys / 2).max(1);
    while subrange_bytes(old, nleft, nkeys) > PAGE_SIZE {
        nleft += 1;
    }
    assert!(nleft < nkeys, "cannot split a node of {nkeys} keys");

    left.set_header(old.btype(), nleft);
    right.set_header(old.btype(), nkeys - nleft);
    left.append_range(old, 0, 0, nleft);
    right.append_range(old, 0, nleft, nkeys - nleft);
}

/// Cuts a possibly-oversized node into 1..=3 page-sized nodes.
fn node_split3(mut old: Node) -> SmallVec<[Node; 3]> {
    if old.nbytes() <= PAGE_SIZE {
        old.truncate_to_page();
        return smallvec![old];
    }
    let mut left = Node::scratch();
    let mut right = Node::new();
    node_split2(&mut left, &mut right, &old);
    if left.nbytes() <= PAGE_SIZE {
        left.truncate_to_page();
        return smallvec![left, right];
    }
    let mut leftleft = Node::new();
    let mut middle = Node::new();
    node_split2(&mut leftleft, &mut middle, &left);
    assert!(leftleft.nbytes() <= PAGE_SIZE, "split produced an oversized node");
    smallvec![leftleft, middle, right]
}

fn tree_delete<S: PageStore>(store: &mut S, node: Node, key: &[u8]) -> Result<Option<Node>> {
    let idx = lookup_le(&node, key);
    match node.btype() {
        NodeType::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut new = Node::new();
            leaf_delete(&mut new, &node, idx);
            Ok(Some(new))
        }
        NodeType::Internal => node_delete(store, node, idx, key),
        NodeType::FreeList => panic!("free-list page reached from the tree"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeSide {
    Left,
    Right,
}

fn node_delete<S: PageStore>(
    store: &mut S,
    node: Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<Node>> {
    let kptr = node.ptr(idx);
    let kid = store.page(kptr)?;
    let Some(updated) = tree_delete(store, kid, key)? else {
        return Ok(None);
    };
    store.dealloc(kptr);

    let mut new = Node::new();
    match should_merge(store, &node, idx, &updated)? {
        Some((MergeSide::Left, sibling)) => {
            let mut merged = Node::new();
            node_merge(&mut merged, &sibling, &updated);
            store.dealloc(node.ptr(idx - 1));
            let first = merged.key(0).to_vec();
            let ptr = store.alloc(merged)?;
            node_replace_2kid(&mut new, &node, idx - 1, ptr, &first);
        }
        Some((MergeSide::Right, sibling)) => {
            let mut merged = Node::new();
            node_merge(&mut merged, &updated, &sibling);
            store.dealloc(node.ptr(idx + 1));
            let first = merged.key(0).to_vec();
            let ptr = store.alloc(merged)?;
            node_replace_2kid(&mut new, &node, idx, ptr, &first);
        }
        None => {
            if updated.nkeys() == 0 {
                // The child emptied out and has no sibling to absorb it,
                // so the parent covers exactly this one child. Propagate an
                // empty internal node; an ancestor with siblings merges it
                // away.
                assert!(node.nkeys() == 1 && idx == 0, "empty child with siblings");
                new.set_header(NodeType::Internal, 0);
            } else {
                node_replace_kid_n(store, &mut new, &node, idx, smallvec![updated])?;
            }
        }
    }
    Ok(Some(new))
}

fn node_merge(new: &mut Node, left: &Node, right: &Node) {
    new.set_header(left.btype(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
}

/// Merge policy: a child at or below a quarter page merges with a sibling
/// when the combined node (sharing one header) fits in a page.
fn should_merge<P: PageRead>(
    store: &P,
    parent: &Node,
    idx: u16,
    updated: &Node,
) -> Result<Option<(MergeSide, Node)>> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(None);
    }
    if idx > 0 {
        let sibling = store.page(parent.ptr(idx - 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER <= PAGE_SIZE {
            return Ok(Some((MergeSide::Left, sibling)));
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = store.page(parent.ptr(idx + 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER <= PAGE_SIZE {
            return Ok(Some((MergeSide::Right, sibling)));
        }
    }
    Ok(None)
}
