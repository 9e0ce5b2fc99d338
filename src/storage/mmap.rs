//! # Chunked Memory Mapping
//!
//! Maps the database file into memory in one or more contiguous chunks whose
//! concatenation covers every live page. The first chunk is created at open
//! (64 MiB, doubled until it covers the file); when the file later outgrows
//! the mapped extent, a new chunk the size of the current total is appended.
//! Existing chunks never move, so page slices handed to readers stay valid
//! for as long as the reader keeps its chunk list alive.
//!
//! ## Sharing Model
//!
//! Chunks are `Arc`-shared between the store, the single writer, and any
//! number of snapshot readers; a snapshot is just a clone of the chunk list.
//! The mapping is a `memmap2::MmapRaw` because the same bytes are read
//! through shared references while the committing writer copies new page
//! images in. That aliasing is sound under the copy-on-write discipline:
//!
//! - a committed page is never rewritten while any snapshot that can reach
//!   it is alive (the free list's version barrier enforces this), and
//! - the master record is written with a positional write, never through
//!   the mapping.
//!
//! Each unsafe access states the piece of that argument it relies on.

use std::fs::File;
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

use super::{INITIAL_MMAP_BYTES, PAGE_SIZE};
use crate::btree::{Node, PageRead};

#[derive(Debug)]
pub struct MmapChunk {
    raw: MmapRaw,
}

impl MmapChunk {
    fn map(file: &File, offset: u64, len: usize) -> Result<Self> {
        ensure!(len % PAGE_SIZE == 0, "chunk length {len} is not page-aligned");
        let raw = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .wrap_err_with(|| format!("failed to map {len} bytes at offset {offset}"))?;
        Ok(Self { raw })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    pub fn page_count(&self) -> u64 {
        (self.raw.len() / PAGE_SIZE) as u64
    }

    /// Borrow one page of this chunk.
    fn page_slice(&self, idx: u64) -> &[u8] {
        debug_assert!(idx < self.page_count());
        let offset = idx as usize * PAGE_SIZE;
        // SAFETY: idx is within the mapped extent (checked by the caller via
        // page_count), and the only writer to this range is the committing
        // writer copying into pages no live snapshot can reach.
        unsafe { std::slice::from_raw_parts(self.raw.as_ptr().add(offset), PAGE_SIZE) }
    }

    /// Copy a page image into this chunk.
    fn write_page(&self, idx: u64, bytes: &[u8]) {
        debug_assert!(idx < self.page_count());
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let offset = idx as usize * PAGE_SIZE;
        // SAFETY: idx is within the mapped extent, and the target page is
        // either brand new (beyond every snapshot's root) or was released
        // past the free list's version barrier, so no reader can be
        // observing it.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.raw.as_mut_ptr().add(offset), PAGE_SIZE);
        }
    }

    fn flush(&self) -> Result<()> {
        self.raw.flush().wrap_err("failed to flush mmap chunk")
    }
}

/// The ordered list of mapped chunks. Cloning is cheap (Arc bumps) and is
/// how snapshots pin the mapping they were created against.
#[derive(Debug, Clone)]
pub struct ChunkList {
    chunks: Vec<Arc<MmapChunk>>,
    total: usize,
}

impl ChunkList {
    /// Creates the initial mapping: 64 MiB, doubled until it covers the
    /// current file size.
    pub fn init(file: &File, file_size: u64) -> Result<Self> {
        let mut total = INITIAL_MMAP_BYTES;
        while (total as u64) < file_size {
            total *= 2;
        }
        let chunk = MmapChunk::map(file, 0, total).wrap_err("initial mmap failed")?;
        Ok(Self {
            chunks: vec![Arc::new(chunk)],
            total,
        })
    }

    /// Total mapped bytes (may exceed the file size).
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn page_capacity(&self) -> u64 {
        (self.total / PAGE_SIZE) as u64
    }

    /// Extends the mapping (by doubling) until it covers `npages` pages.
    pub fn grow(&mut self, file: &File, npages: u64) -> Result<()> {
        while self.page_capacity() < npages {
            let chunk = MmapChunk::map(file, self.total as u64, self.total)
                .wrap_err("failed to extend mmap")?;
            self.chunks.push(Arc::new(chunk));
            self.total *= 2;
        }
        Ok(())
    }

    fn locate(&self, ptr: u64) -> Result<(&MmapChunk, u64)> {
        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + chunk.page_count();
            if ptr < end {
                return Ok((chunk, ptr - start));
            }
            start = end;
        }
        // Falling off the chunk list means the page number came from a
        // corrupt structure, not from a caller bug.
        Err(eyre!("page {ptr} is beyond the mapped extent ({start} pages)"))
    }

    /// Borrow the mapped bytes of page `ptr`.
    pub fn page_slice(&self, ptr: u64) -> Result<&[u8]> {
        let (chunk, idx) = self.locate(ptr)?;
        Ok(chunk.page_slice(idx))
    }

    /// Copy a page image into the mapping.
    pub fn write_page(&self, ptr: u64, bytes: &[u8]) -> Result<()> {
        let (chunk, idx) = self.locate(ptr)?;
        chunk.write_page(idx, bytes);
        Ok(())
    }

    /// Push mapped writes toward the file. The caller still fsyncs the file
    /// descriptor; this covers dirty mapped pages on platforms where fsync
    /// alone does not.
    pub fn flush(&self) -> Result<()> {
        for chunk in &self.chunks {
            chunk.flush()?;
        }
        Ok(())
    }
}

/// Mapped-only page access, used by snapshot readers: it can never observe
/// a writer's buffered pages.
impl PageRead for ChunkList {
    fn page(&self, ptr: u64) -> Result<Node> {
        Ok(Node::from_bytes(self.page_slice(ptr)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn test_file(pages: u64) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(pages * PAGE_SIZE as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn init_maps_at_least_64_mib() {
        let (_dir, file) = test_file(4);

        let chunks = ChunkList::init(&file, 4 * PAGE_SIZE as u64).unwrap();

        assert_eq!(chunks.total(), INITIAL_MMAP_BYTES);
        assert_eq!(chunks.page_capacity(), (INITIAL_MMAP_BYTES / PAGE_SIZE) as u64);
    }

    #[test]
    fn write_page_round_trips_through_the_mapping() {
        let (_dir, file) = test_file(4);
        let chunks = ChunkList::init(&file, 4 * PAGE_SIZE as u64).unwrap();

        let image = vec![0xa5u8; PAGE_SIZE];
        chunks.write_page(2, &image).unwrap();

        assert_eq!(chunks.page_slice(2).unwrap(), &image[..]);
        assert_eq!(chunks.page_slice(1).unwrap()[0], 0);
    }

    #[test]
    fn grow_appends_a_doubling_chunk() {
        let (_dir, file) = test_file(1);
        let mut chunks = ChunkList::init(&file, PAGE_SIZE as u64).unwrap();
        let beyond = (INITIAL_MMAP_BYTES / PAGE_SIZE) as u64 + 1;

        file.set_len(2 * INITIAL_MMAP_BYTES as u64).unwrap();
        chunks.grow(&file, beyond).unwrap();

        assert_eq!(chunks.total(), 2 * INITIAL_MMAP_BYTES);
        assert_eq!(chunks.chunks.len(), 2);
        // a page in the second chunk is addressable
        chunks.page_slice(beyond - 1).unwrap();
    }

    #[test]
    fn page_beyond_extent_is_an_error() {
        let (_dir, file) = test_file(1);
        let chunks = ChunkList::init(&file, PAGE_SIZE as u64).unwrap();

        let result = chunks.page_slice(chunks.page_capacity());

        assert!(result.is_err());
    }

    #[test]
    fn snapshots_keep_reading_after_the_list_grows() {
        let (_dir, file) = test_file(4);
        let mut chunks = ChunkList::init(&file, 4 * PAGE_SIZE as u64).unwrap();
        let image = vec![0x5au8; PAGE_SIZE];
        chunks.write_page(1, &image).unwrap();

        let snapshot = chunks.clone();
        file.set_len(2 * INITIAL_MMAP_BYTES as u64).unwrap();
        chunks
            .grow(&file, (INITIAL_MMAP_BYTES / PAGE_SIZE) as u64 + 1)
            .unwrap();

        assert_eq!(snapshot.page_slice(1).unwrap(), &image[..]);
    }
}
