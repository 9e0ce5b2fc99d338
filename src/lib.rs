//! # coppice — an embedded single-file relational store
//!
//! coppice keeps a relational key-value store in one file, backed by a
//! persistent, copy-on-write B+tree. Every mutation writes new pages and
//! queues the old ones for versioned reuse; publishing a commit is a single
//! atomic rewrite of the master record between two fsync barriers, so a
//! crash always recovers to a complete tree — the old one or the new one,
//! never a hybrid.
//!
//! Concurrency is single-writer, many-reader: writers serialize on a lock,
//! readers capture a snapshot and are lock-free from then on. Reclaimed
//! pages carry the version at which they were freed and are withheld from
//! reuse until every older reader is gone.
//!
//! ## Quick Start
//!
//! ```ignore
//! use coppice::{Cmp, Database, DataType, Record, ScanSpec, TableDef};
//!
//! let db = Database::open("./app.db")?;
//!
//! let mut tx = db.begin_rw();
//! tx.table_new(
//!     TableDef::new("users")
//!         .column("id", DataType::Int64)
//!         .column("name", DataType::Bytes)
//!         .column("age", DataType::Int64)
//!         .primary_keys(1)
//!         .index(["age"]),
//! )?;
//! let mut alice = Record::new();
//! alice.set_int64("id", 1).set_bytes("name", "alice").set_int64("age", 25);
//! tx.insert("users", &alice)?;
//! tx.commit()?;
//!
//! let snap = db.begin_ro();
//! let mut sc = snap.scan("users", ScanSpec::all())?;
//! while sc.valid() {
//!     println!("{:?}", sc.row()?);
//!     sc.next()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Relational Layer (Database/Txn)   │  schema catalog, indexes, scans
//! ├─────────────────────────────────────┤
//! │        Record Codec (records)       │  order-preserving tuple encoding
//! ├─────────────────────────────────────┤
//! │   KV Store + Transactions (kv)      │  writer lock, snapshots, commit
//! ├──────────────────┬──────────────────┤
//! │  B+tree (btree)  │  MVCC (mvcc)     │  copy-on-write map, reader registry
//! ├──────────────────┴──────────────────┤
//! │       Storage Layer (storage)       │  pager, free list, master, mmap
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Format
//!
//! One file of 4096-byte pages. Page 0 opens with the 48-byte master record
//! (signature, root, page count, free-list head, version); pages 1..N hold
//! tree and free-list nodes. The file size is always a multiple of the page
//! size, preallocated in one-eighth increments, and mapped into memory in
//! chunks that double in size and never move.

pub mod btree;
pub mod db;
pub mod kv;
pub mod mvcc;
pub mod records;
pub mod schema;
pub mod storage;

pub use btree::Cmp;
pub use db::{Database, ScanSpec, Scanner, Snapshot, Txn};
pub use kv::{Store, WriteMode, WriteOutcome};
pub use records::{DataType, Record, Value};
pub use schema::TableDef;
