//! # Tree Iterator
//!
//! Ordered traversal over a tree snapshot. The iterator pins a root-to-leaf
//! path of node buffers plus the slot index at each level; `next`/`prev`
//! advance the leaf index and recurse upward when they run off a node edge,
//! then reset every deeper level to the leftmost (or rightmost) descendant.
//!
//! Iterators never mutate. One created on a snapshot stays valid for that
//! snapshot's lifetime; running off either end of the tree invalidates it.

use eyre::Result;
use smallvec::SmallVec;

use super::node::{Node, NodeType};
use super::tree::lookup_le;
use super::PageRead;

/// Seek relation. The discriminants follow the sign convention used by range
/// scans: positive relations walk forward, negative ones walk backward.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Gt = 2,
    Ge = 3,
    Lt = -2,
    Le = -3,
}

impl Cmp {
    pub fn forward(self) -> bool {
        (self as i8) > 0
    }

    /// Does `key` satisfy the relation against `reference`?
    pub fn ok(self, key: &[u8], reference: &[u8]) -> bool {
        match self {
            Cmp::Gt => key > reference,
            Cmp::Ge => key >= reference,
            Cmp::Lt => key < reference,
            Cmp::Le => key <= reference,
        }
    }
}

#[derive(Debug)]
pub struct TreeIter<'s, P: PageRead> {
    store: &'s P,
    path: SmallVec<[Node; 8]>,
    pos: SmallVec<[u16; 8]>,
}

impl<'s, P: PageRead> TreeIter<'s, P> {
    /// Descends from `root`, taking the LE slot at every level. The leaf
    /// index lands on the greatest key <= `key` (possibly the sentinel).
    pub fn seek_le(store: &'s P, root: u64, key: &[u8]) -> Result<Self> {
        let mut iter = TreeIter {
            store,
            path: SmallVec::new(),
            pos: SmallVec::new(),
        };
        let mut ptr = root;
        while ptr != 0 {
            let node = store.page(ptr)?;
            let idx = lookup_le(&node, key);
            ptr = match node.btype() {
                NodeType::Internal => node.ptr(idx),
                NodeType::Leaf => 0,
                NodeType::FreeList => panic!("free-list page reached from the tree"),
            };
            iter.path.push(node);
            iter.pos.push(idx);
        }
        Ok(iter)
    }

    /// Positions at the closest key satisfying `cmp` against `key`.
    pub fn seek(store: &'s P, root: u64, key: &[u8], cmp: Cmp) -> Result<Self> {
        let mut iter = Self::seek_le(store, root, key)?;
        if cmp != Cmp::Le && iter.valid() {
            let (current, _) = iter.deref();
            if !cmp.ok(current, key) {
                // Landed one slot off; step in the relation's direction.
                if cmp.forward() {
                    iter.next()?;
                } else {
                    iter.prev()?;
                }
            }
        }
        Ok(iter)
    }

    pub fn valid(&self) -> bool {
        match (self.path.last(), self.pos.last()) {
            (Some(leaf), Some(&idx)) => idx < leaf.nkeys(),
            _ => false,
        }
    }

    /// Current key and value, borrowed from the pinned leaf.
    pub fn deref(&self) -> (&[u8], &[u8]) {
        assert!(self.valid(), "deref on an invalid iterator");
        let leaf = self.path.last().unwrap();
        let idx = *self.pos.last().unwrap();
        (leaf.key(idx), leaf.val(idx))
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let deepest = self.path.len() - 1;
        if !self.step_next(deepest)? {
            // Past the last key.
            self.path.clear();
            self.pos.clear();
        }
        Ok(())
    }

    pub fn prev(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let deepest = self.path.len() - 1;
        if !self.step_prev(deepest)? {
            // Before the first key.
            self.path.clear();
            self.pos.clear();
        }
        Ok(())
    }

    fn step_next(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] + 1 < self.path[level].nkeys() {
            self.pos[level] += 1;
        } else if level > 0 {
            if !self.step_next(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }
        if level + 1 < self.path.len() {
            // Reposition the child level at its leftmost slot.
            let kid = self.store.page(self.path[level].ptr(self.pos[level]))?;
            self.path[level + 1] = kid;
            self.pos[level + 1] = 0;
        }
        Ok(true)
    }

    fn step_prev(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] > 0 {
            self.pos[level] -= 1;
        } else if level > 0 {
            if !self.step_prev(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }
        if level + 1 < self.path.len() {
            // Reposition the child level at its rightmost slot.
            let kid = self.store.page(self.path[level].ptr(self.pos[level]))?;
            let last = kid.nkeys() - 1;
            self.path[level + 1] = kid;
            self.pos[level + 1] = last;
        }
        Ok(true)
    }
}
