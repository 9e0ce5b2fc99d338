//! # Storage Layer
//!
//! The pager stack: memory-mapped file access, the master page, the
//! transactional page buffer, and the free list.
//!
//! ## Architecture Overview
//!
//! The database is one file of fixed-size pages. Page 0 carries the master
//! record (signature, current root, page count, free-list head); every other
//! page is a B+tree node or a free-list node. The file is mapped into memory
//! in one or more contiguous chunks, and all page reads are served straight
//! from the mapping.
//!
//! Writes never go through the mapping until commit. A transaction buffers
//! new page images in the pager's `updates` map; at commit the pager copies
//! them into the mapping, fsyncs the data, rewrites the master record with a
//! positional write, and fsyncs again. The two fsyncs bracket the master
//! rewrite so that a crash leaves either the old root or the new root
//! published, never a half-written tree.
//!
//! ## Growth
//!
//! The file grows by an eighth of its size (at least one page) using
//! preallocation, so steady insert load does not extend the file on every
//! commit. The mapping grows by doubling: a new chunk is appended and
//! existing chunks never move, which is what lets snapshot readers keep
//! using their chunk list while the writer extends the file.
//!
//! ## Module Organization
//!
//! - `mmap`: chunked memory mapping (`MmapChunk`, `ChunkList`)
//! - `master`: the master record (`MasterPage`)
//! - `pager`: transactional page buffer and the flush protocol (`Pager`)
//! - `freelist`: version-tagged reusable-page queue (`FreeList`)

mod freelist;
mod master;
mod mmap;
mod pager;

pub use freelist::{FreeList, FREE_LIST_CAP, FREE_LIST_HEADER};
pub use master::{MasterPage, DB_SIG, MASTER_SIZE};
pub use mmap::{ChunkList, MmapChunk};
pub use pager::Pager;

pub const PAGE_SIZE: usize = 4096;

/// Initial size of the first mapping; doubled (by appending chunks) as the
/// file outgrows it.
pub const INITIAL_MMAP_BYTES: usize = 64 << 20;

const _: () = assert!(INITIAL_MMAP_BYTES % PAGE_SIZE == 0);
