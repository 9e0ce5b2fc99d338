//! # Pager
//!
//! The writer's page buffer and the commit flush protocol. During a
//! transaction every freshly built node lands in the `updates` map (a `None`
//! entry marks a page the tree deallocated); nothing touches the file or the
//! mapping until commit. Reads resolve through `updates` first and fall back
//! to the mapped file, so a transaction always sees its own writes.
//!
//! ## Allocation
//!
//! New page numbers come from the free list while its version barrier
//! allows, and from the append region (`flushed + nappend`) otherwise. The
//! free-list housekeeping itself uses [`Pager::append`] and [`Pager::put`],
//! which bypass the free list so rebuilding it cannot consume itself.
//!
//! ## Flush Protocol
//!
//! 1. Reconcile the free list with this transaction's pops and releases.
//! 2. Preallocate file space (`+1/8`, at least one page) and extend the
//!    mapping (doubling) if the new high-water mark requires it.
//! 3. Copy every buffered page into its mapped location.
//! 4. fsync — the data barrier; the old master still points at the old tree.
//! 5. Rewrite the master record with a positional write.
//! 6. fsync — the publish barrier.
//!
//! The pager performs steps 1–4; the store sequences 5 and 6 around the
//! in-memory publish.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;

use super::freelist::FreeList;
use super::mmap::ChunkList;
use super::PAGE_SIZE;
use crate::btree::{Node, PageRead};

pub struct Pager {
    pub(crate) file: Arc<File>,
    pub(crate) chunks: ChunkList,
    /// Pages durable in the file as of the last commit.
    pub(crate) flushed: u64,
    /// File length in pages (preallocated, may exceed `flushed`).
    pub(crate) file_pages: u64,
    /// Buffered page images; `None` marks a deallocated page.
    updates: HashMap<u64, Option<Vec<u8>>>,
    /// Entries consumed from the free list this transaction.
    pub(crate) nfree: u64,
    /// Pages appended past `flushed` this transaction.
    pub(crate) nappend: u64,
}

impl Pager {
    pub fn new(file: Arc<File>, chunks: ChunkList, flushed: u64, file_pages: u64) -> Self {
        Self {
            file,
            chunks,
            flushed,
            file_pages,
            updates: HashMap::new(),
            nfree: 0,
            nappend: 0,
        }
    }

    /// Dereferences a page, preferring this transaction's buffered image.
    pub fn page_get(&self, ptr: u64) -> Result<Node> {
        match self.updates.get(&ptr) {
            Some(Some(bytes)) => Ok(Node::from_bytes(bytes)),
            Some(None) => panic!("read of deallocated page {ptr}"),
            None => self.chunks.page(ptr),
        }
    }

    /// Allocates a page for `node`: reuses the next free-list entry when the
    /// version barrier permits, appends past the file tail otherwise.
    pub fn alloc_from(&mut self, free: &FreeList, min_reader: u64, node: Node) -> Result<u64> {
        assert!(node.nbytes() <= PAGE_SIZE, "node exceeds page size");
        let reused = if self.nfree < free.total() {
            let (ptr, version) = free.entry_at(&*self, self.nfree)?;
            (version <= min_reader).then_some(ptr)
        } else {
            None
        };
        let ptr = match reused {
            Some(ptr) => {
                self.nfree += 1;
                ptr
            }
            None => {
                let ptr = self.flushed + self.nappend;
                self.nappend += 1;
                ptr
            }
        };
        self.updates.insert(ptr, Some(node.into_bytes()));
        Ok(ptr)
    }

    /// Marks a page deallocated in this transaction.
    pub fn dealloc(&mut self, ptr: u64) {
        self.updates.insert(ptr, None);
    }

    /// Free-list housekeeping: always appends, never consumes the list.
    pub fn append(&mut self, node: Node) -> u64 {
        assert!(node.nbytes() <= PAGE_SIZE, "node exceeds page size");
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.updates.insert(ptr, Some(node.into_bytes()));
        ptr
    }

    /// Free-list housekeeping: writes `node` at a page it chose itself.
    pub fn put(&mut self, ptr: u64, node: Node) {
        self.updates.insert(ptr, Some(node.into_bytes()));
    }

    /// Steps 1–3 of the flush protocol. `version` tags pages released by
    /// this transaction; `min_reader` is the reuse barrier.
    pub fn write_pages(
        &mut self,
        free: &mut FreeList,
        version: u64,
        min_reader: u64,
    ) -> Result<()> {
        let freed: Vec<(u64, u64)> = self
            .updates
            .iter()
            .filter(|(_, page)| page.is_none())
            .map(|(ptr, _)| (*ptr, version))
            .collect();
        let pop_n = self.nfree;
        free.update(self, pop_n, freed, version, min_reader)?;

        let npages = self.flushed + self.nappend;
        self.extend_file(npages)?;
        self.chunks.grow(&self.file, npages)?;

        for (ptr, page) in &self.updates {
            if let Some(bytes) = page {
                self.chunks.write_page(*ptr, bytes)?;
            }
        }
        Ok(())
    }

    /// Step 4: the data barrier.
    pub fn sync_data(&self) -> Result<()> {
        self.chunks.flush()?;
        self.file.sync_all().wrap_err("fsync failed")
    }

    /// Preallocates file space up to at least `npages`, growing by an
    /// eighth (minimum one page) per round.
    fn extend_file(&mut self, npages: u64) -> Result<()> {
        if self.file_pages >= npages {
            return Ok(());
        }
        let mut file_pages = self.file_pages;
        while file_pages < npages {
            file_pages += (file_pages / 8).max(1);
        }

        let file_size = file_pages * PAGE_SIZE as u64;
        // SAFETY: plain FFI call; the fd is owned by `self.file` and stays
        // open for the duration of the call.
        let ret = unsafe { libc::posix_fallocate(self.file.as_raw_fd(), 0, file_size as libc::off_t) };
        ensure!(
            ret == 0,
            "posix_fallocate to {file_size} bytes failed: {}",
            std::io::Error::from_raw_os_error(ret)
        );
        self.file_pages = file_pages;
        Ok(())
    }
}

impl PageRead for Pager {
    fn page(&self, ptr: u64) -> Result<Node> {
        self.page_get(ptr)
    }
}
