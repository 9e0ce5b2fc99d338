//! # Copy-on-Write B+tree
//!
//! A persistent ordered map from byte keys to byte values. Every mutation
//! builds new nodes and deallocates the ones it replaces; the previous tree
//! stays intact (and readable) until a new root is published, which is what
//! makes snapshot readers and crash recovery cheap.
//!
//! ## Page Store Seam
//!
//! The tree owns nothing but a root page number. All page traffic goes
//! through two capability traits implemented by the pager:
//!
//! - [`PageRead`]: dereference a page number into an owned [`Node`] buffer.
//! - [`PageStore`]: additionally allocate pages for new nodes and mark old
//!   ones as deallocated.
//!
//! Read-only snapshots implement just `PageRead` (they can never allocate),
//! so misuse is a type error rather than a runtime check. Tests drive the
//! tree against an in-memory `PageStore` backed by a hash map.
//!
//! ## Shape Invariants
//!
//! - An internal node's slot `i` holds a copy of the smallest key in the
//!   subtree behind pointer `i`, so an LE-descent always lands in a child
//!   whose range contains the key.
//! - The very first leaf starts with a sentinel slot (empty key) that makes
//!   the tree cover the whole key space; keys are non-empty, so the sentinel
//!   can never collide with real data or be deleted.
//! - Updates may build two-page scratch nodes, but everything handed to
//!   `PageStore::alloc` fits in one page.

mod iter;
mod node;
mod tree;

pub use iter::{Cmp, TreeIter};
pub use node::{Node, NodeType, MAX_KEY_SIZE, MAX_VAL_SIZE, NODE_HEADER};
pub use tree::BTree;

use eyre::Result;

/// Read access to pages by page number.
pub trait PageRead {
    fn page(&self, ptr: u64) -> Result<Node>;
}

/// Full page capabilities required by tree mutations.
pub trait PageStore: PageRead {
    /// Allocates a page number for `node` and records its contents.
    fn alloc(&mut self, node: Node) -> Result<u64>;

    /// Marks the page as deallocated in the current transaction.
    fn dealloc(&mut self, ptr: u64);
}
