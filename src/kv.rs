//! # Key-Value Store
//!
//! The store ties the pager stack and the B+tree together behind a
//! transactional API: one file, one writer at a time, any number of
//! snapshot readers.
//!
//! ## Locking
//!
//! Two locks with distinct jobs:
//!
//! - the **writer lock** serializes read-write transactions and guards the
//!   writer-only state (file high-water mark, free list);
//! - the **snapshot lock** guards the published `{root, version, mapping}`
//!   triple and the reader registry, and is held only long enough to copy
//!   or update them.
//!
//! Readers never block writers and writers never block readers: a reader
//! works entirely off the snapshot it captured at begin.
//!
//! ## Commit
//!
//! A commit runs the pager's flush protocol. After the data fsync the new
//! tree is durable but unreferenced; the store then publishes
//! `{root, version + 1}` in memory, rewrites the master record and fsyncs
//! again. A failure before the data fsync aborts cleanly (nothing observable
//! happened). A failure after it is surfaced but not rolled back: the
//! master's on-disk state is unknowable at that point, and rolling the
//! in-memory root back could publish a stale tree over a newer master.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};

use crate::btree::{BTree, Cmp, Node, PageRead, PageStore, TreeIter};
use crate::mvcc::ReaderTable;
use crate::storage::{ChunkList, FreeList, MasterPage, Pager, MASTER_SIZE, PAGE_SIZE};

/// Behavior of [`WriteTxn::set`] with respect to an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or replace.
    Upsert,
    /// Write only if the key already exists.
    UpdateOnly,
    /// Write only if the key does not exist.
    InsertOnly,
}

/// What a [`WriteTxn::set`] call did.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// A new key was added.
    pub added: bool,
    /// The store was written (new key or changed value).
    pub updated: bool,
    /// Previous value, when the key existed.
    pub old: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Shared {
    root: u64,
    version: u64,
    chunks: ChunkList,
    readers: ReaderTable,
}

#[derive(Debug)]
struct WriterState {
    flushed: u64,
    file_pages: u64,
    free: FreeList,
}

/// A single-file key-value store.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    file: Arc<File>,
    shared: Mutex<Shared>,
    writer: Mutex<WriterState>,
}

impl Store {
    /// Opens (creating if missing) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );
        let file_pages = file_size / PAGE_SIZE as u64;

        let chunks = ChunkList::init(&file, file_size)
            .wrap_err_with(|| format!("failed to map '{}'", path.display()))?;

        let (root, version, flushed, free) = if file_size == 0 {
            // Empty file: page 0 is reserved for the master record, which is
            // written on the first commit.
            (0, 0, 1, FreeList::new())
        } else {
            let page0 = chunks.page_slice(0)?;
            let master = MasterPage::load(&page0[..MASTER_SIZE], file_pages)
                .wrap_err_with(|| format!("invalid master page in '{}'", path.display()))?;
            let free = FreeList::open(master.free_head(), &chunks)?;
            (master.root(), master.version(), master.pages_used(), free)
        };

        Ok(Self {
            path,
            file: Arc::new(file),
            shared: Mutex::new(Shared {
                root,
                version,
                chunks,
                readers: ReaderTable::new(),
            }),
            writer: Mutex::new(WriterState {
                flushed,
                file_pages,
                free,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a read-write transaction. Blocks while another writer holds
    /// the store.
    pub fn begin_rw(&self) -> WriteTxn<'_> {
        let writer = self.writer.lock();
        let (root, version, chunks, min_reader) = {
            let shared = self.shared.lock();
            let min_reader = shared
                .readers
                .min_version()
                .map_or(shared.version, |min| min.min(shared.version));
            (shared.root, shared.version, shared.chunks.clone(), min_reader)
        };
        let pager = Pager::new(
            self.file.clone(),
            chunks,
            writer.flushed,
            writer.file_pages,
        );
        let free = writer.free.clone();
        WriteTxn {
            store: self,
            writer,
            pager,
            free,
            root,
            begin_root: root,
            version,
            min_reader,
        }
    }

    /// Begins a read-only snapshot transaction.
    pub fn begin_ro(&self) -> ReadTxn<'_> {
        let mut shared = self.shared.lock();
        let version = shared.version;
        shared.readers.register(version);
        ReadTxn {
            store: self,
            chunks: shared.chunks.clone(),
            root: shared.root,
            version: shared.version,
        }
    }

    /// Unmaps and closes the file. Outstanding transactions hold borrows,
    /// so this is only callable once they are gone.
    pub fn close(self) {}
}

/// Page capabilities handed to the tree inside a write transaction:
/// allocation consults the free list under the snapshot's reuse barrier.
struct TxnPages<'a> {
    pager: &'a mut Pager,
    free: &'a FreeList,
    min_reader: u64,
}

impl PageRead for TxnPages<'_> {
    fn page(&self, ptr: u64) -> Result<Node> {
        self.pager.page_get(ptr)
    }
}

impl PageStore for TxnPages<'_> {
    fn alloc(&mut self, node: Node) -> Result<u64> {
        self.pager.alloc_from(self.free, self.min_reader, node)
    }

    fn dealloc(&mut self, ptr: u64) {
        self.pager.dealloc(ptr);
    }
}

/// A read-write transaction. Dropping it without [`commit`](Self::commit)
/// aborts: buffered pages and counters are discarded and the writer lock is
/// released.
pub struct WriteTxn<'s> {
    store: &'s Store,
    writer: MutexGuard<'s, WriterState>,
    pager: Pager,
    free: FreeList,
    root: u64,
    begin_root: u64,
    version: u64,
    min_reader: u64,
}

impl<'s> WriteTxn<'s> {
    /// The version this transaction reads at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        BTree::new(self.root).get(&self.pager, key)
    }

    /// Writes `key` according to `mode`. See [`WriteOutcome`] for what each
    /// mode reports.
    pub fn set(&mut self, key: &[u8], val: &[u8], mode: WriteMode) -> Result<WriteOutcome> {
        let old = self.get(key)?;
        let found = old.is_some();
        let write = match mode {
            WriteMode::Upsert => true,
            WriteMode::UpdateOnly => found,
            WriteMode::InsertOnly => !found,
        };
        if !write {
            return Ok(WriteOutcome {
                added: false,
                updated: false,
                old,
            });
        }

        let mut tree = BTree::new(self.root);
        let mut pages = TxnPages {
            pager: &mut self.pager,
            free: &self.free,
            min_reader: self.min_reader,
        };
        tree.insert(&mut pages, key, val)?;
        self.root = tree.root;
        Ok(WriteOutcome {
            added: !found,
            updated: true,
            old,
        })
    }

    /// Deletes `key`; returns whether it existed.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let mut tree = BTree::new(self.root);
        let mut pages = TxnPages {
            pager: &mut self.pager,
            free: &self.free,
            min_reader: self.min_reader,
        };
        let deleted = tree.delete(&mut pages, key)?;
        self.root = tree.root;
        Ok(deleted)
    }

    /// Positions an iterator relative to `key` within this transaction's
    /// view (own writes included).
    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Pager>> {
        TreeIter::seek(&self.pager, self.root, key, cmp)
    }

    pub(crate) fn read_view(&self) -> (&Pager, u64) {
        (&self.pager, self.root)
    }

    /// Commits buffered changes. On success the new snapshot is durable and
    /// published; an error before the data barrier leaves the store as if
    /// the transaction never ran.
    pub fn commit(mut self) -> Result<()> {
        if self.root == self.begin_root {
            return Ok(()); // nothing was written
        }
        let commit_version = self.version + 1;

        // Phase 1: persist page data. Failures here abort cleanly because
        // nothing published references the new pages yet.
        self.pager
            .write_pages(&mut self.free, commit_version, self.min_reader)?;
        self.pager.sync_data()?;

        // The transaction is visible (and the data durable) from here on.
        let flushed = self.pager.flushed + self.pager.nappend;
        self.writer.flushed = flushed;
        self.writer.file_pages = self.pager.file_pages;
        self.writer.free = self.free.clone();
        {
            let mut shared = self.store.shared.lock();
            shared.root = self.root;
            shared.version = commit_version;
            shared.chunks = self.pager.chunks.clone();
        }

        // Phase 2: point the master record at the new tree. This cannot be
        // rolled back on failure: the master's on-disk state is unknown, and
        // republishing the old root over a newer master would corrupt.
        let master = MasterPage::new(self.root, flushed, self.free.head(), commit_version);
        master
            .store(&self.store.file)
            .wrap_err("commit failed after the data barrier")?;
        self.store
            .file
            .sync_all()
            .wrap_err("commit failed after the data barrier")?;
        Ok(())
    }

    /// Discards the transaction. Equivalent to dropping it.
    pub fn abort(self) {}
}

/// A read-only snapshot. Page reads resolve through the mapping captured at
/// begin and never observe a writer's buffered pages. Dropping the snapshot
/// releases its version from the reader registry.
pub struct ReadTxn<'s> {
    store: &'s Store,
    chunks: ChunkList,
    root: u64,
    version: u64,
}

impl<'s> ReadTxn<'s> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        BTree::new(self.root).get(&self.chunks, key)
    }

    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, ChunkList>> {
        TreeIter::seek(&self.chunks, self.root, key, cmp)
    }

    pub(crate) fn read_view(&self) -> (&ChunkList, u64) {
        (&self.chunks, self.root)
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.store.shared.lock().readers.unregister(self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("kv.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn committed_writes_are_visible_to_later_transactions() {
        let (_dir, store) = open_store();

        let mut tx = store.begin_rw();
        tx.set(b"k", b"v", WriteMode::Upsert).unwrap();
        tx.commit().unwrap();

        let tx = store.begin_rw();
        assert_eq!(tx.get(b"k").unwrap().unwrap(), b"v");
        tx.abort();
    }

    #[test]
    fn abort_discards_buffered_writes() {
        let (_dir, store) = open_store();
        let mut tx = store.begin_rw();
        tx.set(b"gone", b"1", WriteMode::Upsert).unwrap();
        tx.abort();

        let tx = store.begin_rw();
        assert_eq!(tx.get(b"gone").unwrap(), None);
        tx.abort();
    }

    #[test]
    fn empty_commit_does_not_bump_the_version() {
        let (_dir, store) = open_store();

        let tx = store.begin_rw();
        let v0 = tx.version();
        tx.commit().unwrap();

        let tx = store.begin_rw();
        assert_eq!(tx.version(), v0);
        tx.abort();
    }

    #[test]
    fn each_commit_gets_its_own_version() {
        let (_dir, store) = open_store();
        for i in 0..5u8 {
            let mut tx = store.begin_rw();
            let expected = i as u64;
            assert_eq!(tx.version(), expected);
            tx.set(b"counter", &[i], WriteMode::Upsert).unwrap();
            tx.commit().unwrap();
        }
    }

    #[test]
    fn write_modes_follow_key_existence() {
        let (_dir, store) = open_store();
        let mut tx = store.begin_rw();

        let out = tx.set(b"k", b"1", WriteMode::UpdateOnly).unwrap();
        assert!(!out.updated && !out.added);

        let out = tx.set(b"k", b"1", WriteMode::InsertOnly).unwrap();
        assert!(out.updated && out.added);

        let out = tx.set(b"k", b"2", WriteMode::InsertOnly).unwrap();
        assert!(!out.updated);
        assert_eq!(out.old.as_deref(), Some(&b"1"[..]));

        let out = tx.set(b"k", b"2", WriteMode::UpdateOnly).unwrap();
        assert!(out.updated && !out.added);

        let out = tx.set(b"k", b"3", WriteMode::Upsert).unwrap();
        assert!(out.updated && !out.added);
        assert_eq!(out.old.as_deref(), Some(&b"2"[..]));

        assert_eq!(tx.get(b"k").unwrap().unwrap(), b"3");
        tx.commit().unwrap();
    }

    #[test]
    fn transaction_sees_its_own_writes_through_seek() {
        let (_dir, store) = open_store();
        let mut tx = store.begin_rw();
        tx.set(b"a", b"1", WriteMode::Upsert).unwrap();
        tx.set(b"b", b"2", WriteMode::Upsert).unwrap();

        let iter = tx.seek(b"a", Cmp::Ge).unwrap();

        assert!(iter.valid());
        assert_eq!(iter.deref().0, b"a");
        tx.abort();
    }

    #[test]
    fn snapshot_is_isolated_from_later_commits() {
        let (_dir, store) = open_store();
        let mut tx = store.begin_rw();
        tx.set(b"k", b"old", WriteMode::Upsert).unwrap();
        tx.commit().unwrap();

        let snapshot = store.begin_ro();
        let mut tx = store.begin_rw();
        tx.set(b"k", b"new", WriteMode::Upsert).unwrap();
        tx.set(b"extra", b"x", WriteMode::Upsert).unwrap();
        tx.commit().unwrap();

        assert_eq!(snapshot.get(b"k").unwrap().unwrap(), b"old");
        assert_eq!(snapshot.get(b"extra").unwrap(), None);
        drop(snapshot);

        let fresh = store.begin_ro();
        assert_eq!(fresh.get(b"k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn reopen_preserves_committed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = Store::open(&path).unwrap();
            let mut tx = store.begin_rw();
            for i in 0..200u32 {
                let k = format!("key_{i}");
                let v = format!("value_{i}");
                tx.set(k.as_bytes(), v.as_bytes(), WriteMode::Upsert).unwrap();
            }
            tx.commit().unwrap();
            store.close();
        }

        let store = Store::open(&path).unwrap();
        let tx = store.begin_ro();
        for i in 0..200u32 {
            let k = format!("key_{i}");
            assert_eq!(
                tx.get(k.as_bytes()).unwrap().unwrap(),
                format!("value_{i}").as_bytes()
            );
        }
    }

    #[test]
    fn reopen_preserves_the_version_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = Store::open(&path).unwrap();
            for i in 0..3u8 {
                let mut tx = store.begin_rw();
                tx.set(b"k", &[i], WriteMode::Upsert).unwrap();
                tx.commit().unwrap();
            }
        }

        let store = Store::open(&path).unwrap();
        let tx = store.begin_ro();
        assert_eq!(tx.version(), 3);
    }

    #[test]
    fn corrupted_signature_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = Store::open(&path).unwrap();
            let mut tx = store.begin_rw();
            tx.set(b"k", b"v", WriteMode::Upsert).unwrap();
            tx.commit().unwrap();
        }

        use std::os::unix::fs::FileExt;
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_at(&[0u8; 16], 0).unwrap();

        let err = Store::open(&path).unwrap_err();
        assert!(format!("{err:#}").contains("signature"));
    }

    #[test]
    fn file_size_must_be_page_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let err = Store::open(&path).unwrap_err();
        assert!(err.to_string().contains("multiple of page size"));
    }

    #[test]
    fn deleted_pages_are_reused_after_readers_release() {
        let (_dir, store) = open_store();
        let mut tx = store.begin_rw();
        for i in 0..100u32 {
            tx.set(format!("k{i}").as_bytes(), &[0u8; 500], WriteMode::Upsert)
                .unwrap();
        }
        tx.commit().unwrap();
        let baseline = store.writer.lock().flushed;

        // churn the same keys: frees pages each commit, then reuses them
        let mut peak = 0;
        for round in 0..10u32 {
            let mut tx = store.begin_rw();
            for i in 0..100u32 {
                tx.set(
                    format!("k{i}").as_bytes(),
                    &[round as u8; 500],
                    WriteMode::Upsert,
                )
                .unwrap();
            }
            tx.commit().unwrap();
            peak = store.writer.lock().flushed;
        }

        // each round recycles roughly a round's worth of pages; without
        // reuse the high-water mark would be ~11x the baseline
        assert!(
            peak < baseline * 3,
            "high-water mark {peak} pages from a baseline of {baseline}; \
             free-list reuse is not working"
        );
    }
}
