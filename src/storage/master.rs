//! # Master Page
//!
//! The first 48 bytes of page 0. Rewriting this record is the atomic
//! publish of a new tree: everything else written during a commit is
//! unreachable until the master points at it.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------
//! 0       16    ASCII signature ("coppice format 1")
//! 16      8     current root page number
//! 24      8     pages in use (file high-water mark)
//! 32      8     free-list head page (0 = empty list)
//! 40      8     commit version counter
//! ```
//!
//! All integers little-endian. The record is loaded through the mapping but
//! stored with a positional write on the file descriptor: an mmap store is
//! not atomic across a crash, a small aligned `pwrite` is.
//!
//! The persisted version counter keeps free-list version tags meaningful
//! across reopen; without it a fresh process would start below every tag
//! and the reuse barrier would pin the whole list.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const DB_SIG: &[u8; 16] = b"coppice format 1";
pub const MASTER_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    sig: [u8; 16],
    root: U64,
    pages_used: U64,
    free_head: U64,
    version: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_SIZE);

impl MasterPage {
    pub fn new(root: u64, pages_used: u64, free_head: u64, version: u64) -> Self {
        Self {
            sig: *DB_SIG,
            root: U64::new(root),
            pages_used: U64::new(pages_used),
            free_head: U64::new(free_head),
            version: U64::new(version),
        }
    }

    /// Parses and validates the master record against the actual file size
    /// (in pages). Violations are corruption: the file is unusable until
    /// repaired externally.
    pub fn load(bytes: &[u8], file_pages: u64) -> Result<Self> {
        ensure!(
            bytes.len() >= MASTER_SIZE,
            "buffer too small for MasterPage: {} < {}",
            bytes.len(),
            MASTER_SIZE
        );
        let master = Self::read_from_bytes(&bytes[..MASTER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MasterPage: {e:?}"))?;

        ensure!(&master.sig == DB_SIG, "bad database signature");
        let used = master.pages_used();
        ensure!(
            used >= 1 && used <= file_pages,
            "master page count {used} outside file bounds ({file_pages} pages)"
        );
        ensure!(
            master.root() < used,
            "master root {} outside used pages ({used})",
            master.root()
        );
        let free_head = master.free_head();
        ensure!(
            free_head == 0 || (free_head >= 1 && free_head < used),
            "master free-list head {free_head} outside used pages ({used})"
        );
        Ok(master)
    }

    /// Atomically publishes this record at offset 0.
    pub fn store(&self, file: &File) -> Result<()> {
        file.write_at(self.as_bytes(), 0)
            .wrap_err("failed to write master page")?;
        Ok(())
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn set_root(&mut self, root: u64) {
        self.root = U64::new(root);
    }

    pub fn pages_used(&self) -> u64 {
        self.pages_used.get()
    }

    pub fn set_pages_used(&mut self, pages: u64) {
        self.pages_used = U64::new(pages);
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }

    pub fn set_free_head(&mut self, page_no: u64) {
        self.free_head = U64::new(page_no);
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = U64::new(version);
    }
}
