//! # Versioned Free List
//!
//! Copy-on-write deallocates a page on every mutation, so reclaiming that
//! storage is what keeps the file from growing forever. Freed page numbers
//! are queued in an on-disk linked list of page-sized nodes, and each entry
//! carries the writer version at which the page was released: a page may be
//! handed out again only once no live reader could still be traversing the
//! tree that referenced it.
//!
//! ## Node Layout
//!
//! Free-list nodes reuse the page container (type 3):
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------
//! 0       2     node type (3)
//! 2       2     size: entries stored in this node
//! 4       8     total: live entries in the whole list (head node only)
//! 12      8     next: page number of the next node (0 = tail)
//! 20      16*n  entries: page number u64, release version u64
//! ```
//!
//! ## Update Discipline
//!
//! The list is read during a transaction (the pager consumes a prefix of
//! entries) but rewritten only once, at commit, by [`FreeList::update`]:
//! consumed entries are dropped, fully drained list nodes are recycled into
//! the freed set, and the freed set is pushed back in new nodes — housed in
//! recycled pages where the version barrier already allows it, appended
//! otherwise. Every page written belongs to the transaction's update
//! buffer, so the chain published by the previous master is untouched on
//! disk until the master swap.
//!
//! Consumption order puts the oldest surviving entries first, so the
//! barrier check degrades into "stop at the first entry still pinned by a
//! reader" — and everything unblocks as soon as that reader ends.

use eyre::Result;

use super::pager::Pager;
use super::PAGE_SIZE;
use crate::btree::{Node, NodeType, PageRead};

pub const FREE_LIST_HEADER: usize = 20;
pub const FREE_LIST_CAP: usize = (PAGE_SIZE - FREE_LIST_HEADER) / 16;

fn fl_size(node: &Node) -> u64 {
    node.nkeys() as u64
}

fn fl_total(node: &Node) -> u64 {
    node.read_u64(4)
}

fn fl_set_total(node: &mut Node, total: u64) {
    node.write_u64(4, total);
}

fn fl_next(node: &Node) -> u64 {
    node.read_u64(12)
}

fn fl_set_header(node: &mut Node, size: u16, next: u64) {
    node.set_header(NodeType::FreeList, size);
    node.write_u64(12, next);
}

fn fl_entry(node: &Node, idx: usize) -> (u64, u64) {
    let pos = FREE_LIST_HEADER + idx * 16;
    (node.read_u64(pos), node.read_u64(pos + 8))
}

fn fl_set_entry(node: &mut Node, idx: usize, ptr: u64, version: u64) {
    assert!(idx < FREE_LIST_CAP, "free-list entry index out of bounds");
    let pos = FREE_LIST_HEADER + idx * 16;
    node.write_u64(pos, ptr);
    node.write_u64(pos + 8, version);
}

/// In-memory handle on the persistent list: the head page plus a cached
/// entry count (whose authoritative copy lives in the head node).
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    head: u64,
    total: u64,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the handle from a persisted head pointer.
    pub fn open<P: PageRead>(head: u64, store: &P) -> Result<Self> {
        let total = if head == 0 {
            0
        } else {
            fl_total(&store.page(head)?)
        };
        Ok(Self { head, total })
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// The nth entry counted from the consumption end. Walks the chain.
    pub fn entry_at<P: PageRead>(&self, store: &P, n: u64) -> Result<(u64, u64)> {
        assert!(n < self.total, "free-list index {n} out of bounds");
        let mut node = store.page(self.head)?;
        let mut topn = n;
        while fl_size(&node) <= topn {
            topn -= fl_size(&node);
            let next = fl_next(&node);
            assert!(next != 0, "free list shorter than its total");
            node = store.page(next)?;
        }
        Ok(fl_entry(&node, (fl_size(&node) - topn - 1) as usize))
    }

    /// Commits this transaction's consumption and releases in one pass:
    /// drops the `pop_n` consumed entries, pushes `freed` (page, version)
    /// pairs, and recycles drained list nodes through the list itself.
    /// `version` tags recycled node pages; `min_reader` gates which freed
    /// pages may immediately house new list nodes.
    pub fn update(
        &mut self,
        pager: &mut Pager,
        pop_n: u64,
        mut freed: Vec<(u64, u64)>,
        version: u64,
        min_reader: u64,
    ) -> Result<()> {
        assert!(pop_n <= self.total, "pop count exceeds free-list total");
        if pop_n == 0 && freed.is_empty() {
            return Ok(());
        }

        let mut total = self.total;
        let mut reuse: Vec<u64> = Vec::new();
        let mut popn = pop_n;

        // Drain from the head: consumed entries disappear, surviving entries
        // are re-pushed below with their original version tags, and each
        // drained node page becomes free itself.
        while self.head != 0 && (popn > 0 || reuse.len() * FREE_LIST_CAP < freed.len()) {
            let node = pager.page_get(self.head)?;
            freed.push((self.head, version));
            let size = fl_size(&node);
            if popn >= size {
                popn -= size;
            } else {
                let mut remain = size - popn;
                popn = 0;
                // Harvest pages to house the rebuilt list, newest survivors
                // first; pages still pinned by a reader stay queued instead.
                while remain > 0 && reuse.len() * FREE_LIST_CAP < freed.len() + remain as usize {
                    remain -= 1;
                    let (ptr, ver) = fl_entry(&node, remain as usize);
                    if ver <= min_reader {
                        reuse.push(ptr);
                    } else {
                        freed.push((ptr, ver));
                    }
                }
                for i in 0..remain {
                    let (ptr, ver) = fl_entry(&node, i as usize);
                    freed.push((ptr, ver));
                }
            }
            total -= size;
            self.head = fl_next(&node);
        }
        assert_eq!(popn, 0, "consumed entries not found at the head");

        let new_total = total + freed.len() as u64;
        self.push(pager, freed, reuse);

        let mut head = pager.page_get(self.head)?;
        fl_set_total(&mut head, new_total);
        pager.put(self.head, head);
        self.total = new_total;
        Ok(())
    }

    fn push(&mut self, pager: &mut Pager, mut freed: Vec<(u64, u64)>, mut reuse: Vec<u64>) {
        while !freed.is_empty() {
            let size = freed.len().min(FREE_LIST_CAP);
            let mut node = Node::new();
            fl_set_header(&mut node, size as u16, self.head);
            for (i, (ptr, ver)) in freed[..size].iter().enumerate() {
                fl_set_entry(&mut node, i, *ptr, *ver);
            }
            freed.drain(..size);

            if let Some(ptr) = reuse.pop() {
                self.head = ptr;
                pager.put(ptr, node);
            } else {
                self.head = pager.append(node);
            }
        }
        debug_assert!(reuse.is_empty(), "harvested more pages than the list needs");
    }
}
