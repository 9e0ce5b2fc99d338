//! # Relational Layer
//!
//! Translates record operations into key-value operations against the
//! B+tree and keeps secondary indexes in step with row writes.
//!
//! ## Key Shapes
//!
//! - Primary tree: `prefix | encoded pk columns` -> encoded remaining
//!   columns.
//! - Secondary index tree: `index prefix | encoded index columns (always
//!   ending in the full primary key)` -> empty value. Dereferencing an
//!   index entry re-reads the row by primary key.
//!
//! ## Index Maintenance
//!
//! Index upkeep runs whenever a row was actually written: an update first
//! deletes the old row's index entries (recovered from the previous value),
//! then inserts the new ones; a row delete fetches the row before removing
//! it so entries on non-key columns can be found. Overwrites that leave
//! indexed columns unchanged still issue the delete+insert pair; the
//! redundancy is cheap and keeps the write path uniform.
//!
//! ## Scans
//!
//! A range scan picks the narrowest tree whose key columns are prefixed by
//! the caller's bound columns (the primary key wins ties), encodes partial
//! start and end bounds, and walks the underlying tree iterator forward or
//! backward depending on the start relation's direction. The two relations
//! must point inward; anything else is a range error.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::btree::{BTree, Cmp, PageRead};
use crate::kv::{ReadTxn, Store, WriteMode, WriteTxn};
use crate::records::encode::{decode_values, encode_key, encode_key_partial, encode_values};
use crate::records::{DataType, Record, Value};
use crate::schema::{
    catalog_table, from_json, meta_table, to_json, TableDef, CATALOG_TABLE, META_TABLE,
    TABLE_PREFIX_MIN,
};
use crate::storage::Pager;

/// An embedded relational store: one file, schema catalog included.
pub struct Database {
    store: Store,
    tables: Mutex<HashMap<String, Arc<TableDef>>>,
}

impl Database {
    /// Opens (creating if missing) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            store: Store::open(path)?,
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Begins a read-write transaction (serialized with other writers).
    pub fn begin_rw(&self) -> Txn<'_> {
        Txn {
            db: self,
            kv: self.store.begin_rw(),
            created: Vec::new(),
        }
    }

    /// Begins a read-only snapshot.
    pub fn begin_ro(&self) -> Snapshot<'_> {
        Snapshot {
            db: self,
            kv: self.store.begin_ro(),
        }
    }

    pub fn close(self) {}

    /// Resolves a table definition through the given page view, consulting
    /// the cache first. Definitions are immutable once created, so cached
    /// entries cannot go stale; `cache` is false inside write transactions,
    /// whose view may include uncommitted definitions that must not outlive
    /// an abort.
    fn try_table_def<P: PageRead>(
        &self,
        pages: &P,
        root: u64,
        name: &str,
        cache: bool,
    ) -> Result<Option<Arc<TableDef>>> {
        if name == META_TABLE {
            return Ok(Some(Arc::new(meta_table())));
        }
        if name == CATALOG_TABLE {
            return Ok(Some(Arc::new(catalog_table())));
        }
        if let Some(tdef) = self.tables.lock().get(name) {
            return Ok(Some(tdef.clone()));
        }

        let catalog = catalog_table();
        let mut rec = Record::new();
        rec.set_bytes("name", name.as_bytes().to_vec());
        if !read_row(pages, root, &catalog, &mut rec)? {
            return Ok(None);
        }
        let tdef = Arc::new(from_json(rec.get("def").unwrap().as_bytes()?)?);
        if cache {
            self.tables.lock().insert(name.to_string(), tdef.clone());
        }
        Ok(Some(tdef))
    }

    fn table_def<P: PageRead>(
        &self,
        pages: &P,
        root: u64,
        name: &str,
        cache: bool,
    ) -> Result<Arc<TableDef>> {
        match self.try_table_def(pages, root, name, cache)? {
            Some(tdef) => Ok(tdef),
            None => bail!("table not found: {name}"),
        }
    }
}

/// Bounds of a range scan: two partially bound keys and the relations the
/// result keys must satisfy against them. The relations must point inward
/// (one forward, one backward).
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub key1: Record,
    pub key2: Record,
    pub cmp1: Cmp,
    pub cmp2: Cmp,
}

impl ScanSpec {
    /// A full-table scan in primary-key order.
    pub fn all() -> Self {
        Self {
            key1: Record::new(),
            key2: Record::new(),
            cmp1: Cmp::Ge,
            cmp2: Cmp::Le,
        }
    }

    /// An equality scan on the given bound columns.
    pub fn exact(key: Record) -> Self {
        Self {
            key2: key.clone(),
            key1: key,
            cmp1: Cmp::Ge,
            cmp2: Cmp::Le,
        }
    }

    pub fn range(key1: Record, cmp1: Cmp, key2: Record, cmp2: Cmp) -> Self {
        Self { key1, key2, cmp1, cmp2 }
    }
}

/// A read-write transaction over tables.
pub struct Txn<'d> {
    db: &'d Database,
    kv: WriteTxn<'d>,
    /// Definitions created in this transaction; promoted to the shared
    /// cache only once the transaction commits.
    created: Vec<Arc<TableDef>>,
}

impl<'d> Txn<'d> {
    /// Creates a table: validates the definition, assigns key prefixes from
    /// the catalog counter, and persists it. Returns the completed
    /// definition.
    pub fn table_new(&mut self, mut tdef: TableDef) -> Result<TableDef> {
        tdef.validate()?;
        ensure!(
            !tdef.name.starts_with('@'),
            "table name '{}' is reserved",
            tdef.name
        );
        {
            let (pages, root) = self.kv.read_view();
            if self.db.try_table_def(pages, root, &tdef.name, false)?.is_some() {
                bail!("table exists: {}", tdef.name);
            }
        }

        // allocate one prefix per tree from the @meta counter
        let meta = meta_table();
        let mut next = TABLE_PREFIX_MIN;
        {
            let (pages, root) = self.kv.read_view();
            let mut rec = Record::new();
            rec.set_bytes("key", "next_prefix");
            if read_row(pages, root, &meta, &mut rec)? {
                let raw = rec.get("val").unwrap().as_bytes()?.to_vec();
                ensure!(raw.len() == 4, "corrupt next_prefix value");
                next = u32::from_le_bytes(raw.try_into().unwrap());
                ensure!(next >= TABLE_PREFIX_MIN, "corrupt next_prefix value");
            }
        }
        tdef.prefix = next;
        tdef.index_prefixes = (0..tdef.indexes.len())
            .map(|i| next + 1 + i as u32)
            .collect();
        let ntrees = 1 + tdef.indexes.len() as u32;

        let mut bump = Record::new();
        bump.set_bytes("key", "next_prefix")
            .set_bytes("val", (next + ntrees).to_le_bytes().to_vec());
        self.write_row(&meta, &bump, WriteMode::Upsert)?;

        let mut entry = Record::new();
        entry
            .set_bytes("name", tdef.name.as_bytes().to_vec())
            .set_bytes("def", to_json(&tdef)?);
        self.write_row(&catalog_table(), &entry, WriteMode::Upsert)?;

        self.created.push(Arc::new(tdef.clone()));
        Ok(tdef)
    }

    /// Fetches the row whose primary key is in `rec`, filling in the
    /// remaining columns. Returns false when no such row exists.
    pub fn get(&self, table: &str, rec: &mut Record) -> Result<bool> {
        let (pages, root) = self.kv.read_view();
        let tdef = self.db.table_def(pages, root, table, false)?;
        read_row(pages, root, &tdef, rec)
    }

    /// Inserts a full row; fails silently (returns false) if the key exists.
    pub fn insert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write_named(table, rec, WriteMode::InsertOnly)
    }

    /// Rewrites an existing row; returns false if the key does not exist.
    pub fn update(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write_named(table, rec, WriteMode::UpdateOnly)
    }

    /// Inserts or replaces a full row.
    pub fn upsert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write_named(table, rec, WriteMode::Upsert)
    }

    fn write_named(&mut self, table: &str, rec: &Record, mode: WriteMode) -> Result<bool> {
        let tdef = {
            let (pages, root) = self.kv.read_view();
            self.db.table_def(pages, root, table, false)?
        };
        self.write_row(&tdef, rec, mode)
    }

    fn write_row(&mut self, tdef: &TableDef, rec: &Record, mode: WriteMode) -> Result<bool> {
        let vals = check_record(tdef, rec, tdef.cols.len())?;
        let key = encode_key(tdef.prefix, &vals[..tdef.pkeys]);
        let mut val = Vec::new();
        encode_values(&mut val, &vals[tdef.pkeys..]);

        let out = self.kv.set(&key, &val, mode)?;
        if !out.updated || tdef.indexes.is_empty() {
            return Ok(out.added);
        }

        if !out.added {
            if let Some(old) = &out.old {
                let mut old_vals = vals[..tdef.pkeys].to_vec();
                old_vals.extend(decode_values(old, &tdef.types[tdef.pkeys..])?);
                let old_row = Record::from_parts(tdef.cols.clone(), old_vals);
                self.index_ops(tdef, &old_row, false)?;
            }
        }
        let new_row = Record::from_parts(tdef.cols.clone(), vals);
        self.index_ops(tdef, &new_row, true)?;
        Ok(out.added)
    }

    /// Deletes the row whose primary key is in `rec`. Returns whether a row
    /// was removed.
    pub fn delete(&mut self, table: &str, rec: &Record) -> Result<bool> {
        let tdef = {
            let (pages, root) = self.kv.read_view();
            self.db.table_def(pages, root, table, false)?
        };
        let pk_vals = check_record(&tdef, rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &pk_vals);

        // fetch the row first: index entries on non-key columns can only be
        // rebuilt from the stored values
        let Some(old) = self.kv.get(&key)? else {
            return Ok(false);
        };
        let deleted = self.kv.del(&key)?;
        assert!(deleted, "row vanished inside the transaction");

        if !tdef.indexes.is_empty() {
            let mut old_vals = pk_vals;
            old_vals.extend(decode_values(&old, &tdef.types[tdef.pkeys..])?);
            let old_row = Record::from_parts(tdef.cols.clone(), old_vals);
            self.index_ops(&tdef, &old_row, false)?;
        }
        Ok(true)
    }

    fn index_ops(&mut self, tdef: &TableDef, row: &Record, add: bool) -> Result<()> {
        for (i, index) in tdef.indexes.iter().enumerate() {
            let vals: Vec<Value> = index
                .iter()
                .map(|col| row.get(col).unwrap().clone())
                .collect();
            let key = encode_key(tdef.index_prefixes[i], &vals);
            if add {
                let out = self.kv.set(&key, b"", WriteMode::Upsert)?;
                assert!(out.updated, "index insert did not write");
            } else {
                let removed = self.kv.del(&key)?;
                assert!(removed, "missing index entry on delete");
            }
        }
        Ok(())
    }

    /// Opens a range scan. See [`ScanSpec`] for the bound semantics.
    pub fn scan(&self, table: &str, spec: ScanSpec) -> Result<Scanner<'_, Pager>> {
        let (pages, root) = self.kv.read_view();
        let tdef = self.db.table_def(pages, root, table, false)?;
        scan_impl(pages, root, tdef, spec)
    }

    pub fn commit(self) -> Result<()> {
        self.kv.commit()?;
        let mut cache = self.db.tables.lock();
        for tdef in self.created {
            cache.insert(tdef.name.clone(), tdef);
        }
        Ok(())
    }

    pub fn abort(self) {
        self.kv.abort()
    }
}

/// A read-only snapshot over tables.
pub struct Snapshot<'d> {
    db: &'d Database,
    kv: ReadTxn<'d>,
}

impl<'d> Snapshot<'d> {
    pub fn version(&self) -> u64 {
        self.kv.version()
    }

    pub fn get(&self, table: &str, rec: &mut Record) -> Result<bool> {
        let (pages, root) = self.kv.read_view();
        let tdef = self.db.table_def(pages, root, table, true)?;
        read_row(pages, root, &tdef, rec)
    }

    pub fn scan(
        &self,
        table: &str,
        spec: ScanSpec,
    ) -> Result<Scanner<'_, crate::storage::ChunkList>> {
        let (pages, root) = self.kv.read_view();
        let tdef = self.db.table_def(pages, root, table, true)?;
        scan_impl(pages, root, tdef, spec)
    }
}

/// Reorders `rec` against the schema and returns the first `n` column
/// values. All primary-key columns must be present; when `n` covers the
/// whole row, every column must be.
fn check_record(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Value>> {
    for col in rec.cols() {
        ensure!(
            tdef.cols.contains(col),
            "table '{}' has no column '{col}'",
            tdef.name
        );
    }
    let mut vals = Vec::with_capacity(n);
    for i in 0..n {
        let col = &tdef.cols[i];
        let Some(val) = rec.get(col) else {
            if i < tdef.pkeys {
                bail!("missing primary key column: {col}");
            }
            bail!("missing column: {col}");
        };
        ensure!(
            val.data_type() == tdef.types[i],
            "column '{col}' has the wrong type"
        );
        vals.push(val.clone());
    }
    Ok(vals)
}

/// Fetches one row by primary key and materializes it into `rec`.
fn read_row<P: PageRead>(
    pages: &P,
    root: u64,
    tdef: &TableDef,
    rec: &mut Record,
) -> Result<bool> {
    let pk_vals = check_record(tdef, rec, tdef.pkeys)?;
    let key = encode_key(tdef.prefix, &pk_vals);
    let Some(stored) = BTree::new(root).get(pages, &key)? else {
        return Ok(false);
    };
    let rest = decode_values(&stored, &tdef.types[tdef.pkeys..])?;

    rec.clear();
    for (col, val) in tdef.cols.iter().zip(pk_vals.into_iter().chain(rest)) {
        rec.push(col.clone(), val);
    }
    Ok(true)
}

fn is_prefix(long: &[String], short: &[String]) -> bool {
    long.len() >= short.len() && long.iter().zip(short).all(|(a, b)| a == b)
}

/// Picks the tree for a scan: the primary key when the bound columns
/// prefix it, else the narrowest matching secondary index.
fn find_index(tdef: &TableDef, keys: &[String]) -> Result<Option<usize>> {
    if is_prefix(tdef.primary_key_cols(), keys) {
        return Ok(None);
    }
    let mut winner: Option<usize> = None;
    for (i, index) in tdef.indexes.iter().enumerate() {
        if !is_prefix(index, keys) {
            continue;
        }
        if winner.map_or(true, |w| index.len() < tdef.indexes[w].len()) {
            winner = Some(i);
        }
    }
    match winner {
        Some(i) => Ok(Some(i)),
        None => bail!(
            "no index of table '{}' matches columns {:?}",
            tdef.name,
            keys
        ),
    }
}

fn scan_impl<'p, P: PageRead>(
    pages: &'p P,
    root: u64,
    tdef: Arc<TableDef>,
    spec: ScanSpec,
) -> Result<Scanner<'p, P>> {
    let inward = (spec.cmp1.forward() && !spec.cmp2.forward())
        || (!spec.cmp1.forward() && spec.cmp2.forward());
    ensure!(inward, "bad range: the two relations must point inward");
    ensure!(
        spec.key1.cols() == spec.key2.cols(),
        "bad range: bounds must cover the same columns"
    );

    let index_no = find_index(&tdef, spec.key1.cols())?;
    let (index_cols, prefix): (&[String], u32) = match index_no {
        None => (tdef.primary_key_cols(), tdef.prefix),
        Some(i) => (&tdef.indexes[i], tdef.index_prefixes[i]),
    };
    let types: Vec<DataType> = index_cols
        .iter()
        .map(|c| tdef.col_type(c).unwrap())
        .collect();

    let vals1 = ordered_vals(&spec.key1, index_cols, &types)?;
    let vals2 = ordered_vals(&spec.key2, index_cols, &types)?;
    let key_start = encode_key_partial(prefix, &vals1, &types, spec.cmp1);
    let key_end = encode_key_partial(prefix, &vals2, &types, spec.cmp2);

    let iter = crate::btree::TreeIter::seek(pages, root, &key_start, spec.cmp1)?;
    Ok(Scanner {
        pages,
        root,
        tdef,
        index_no,
        cmp2: spec.cmp2,
        key_end,
        forward: spec.cmp1.forward(),
        iter,
    })
}

fn ordered_vals(rec: &Record, index_cols: &[String], types: &[DataType]) -> Result<Vec<Value>> {
    rec.cols()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            ensure!(
                index_cols.get(i) == Some(col),
                "bound column '{col}' is out of index order"
            );
            let val = rec.vals()[i].clone();
            ensure!(
                val.data_type() == types[i],
                "bound column '{col}' has the wrong type"
            );
            Ok(val)
        })
        .collect()
}

/// An in-progress range scan. `valid` / `next` / `deref_into` mirror the
/// underlying tree iterator, with rows materialized per the table schema.
#[derive(Debug)]
pub struct Scanner<'p, P: PageRead> {
    pages: &'p P,
    root: u64,
    tdef: Arc<TableDef>,
    index_no: Option<usize>,
    cmp2: Cmp,
    key_end: Vec<u8>,
    forward: bool,
    iter: crate::btree::TreeIter<'p, P>,
}

impl<'p, P: PageRead> Scanner<'p, P> {
    /// Is the scanner positioned on a row inside the range?
    pub fn valid(&self) -> bool {
        if !self.iter.valid() {
            return false;
        }
        let (key, _) = self.iter.deref();
        self.cmp2.ok(key, &self.key_end)
    }

    /// Advances toward the far bound (direction follows the start relation).
    pub fn next(&mut self) -> Result<()> {
        assert!(self.valid(), "next on an invalid scanner");
        if self.forward {
            self.iter.next()
        } else {
            self.iter.prev()
        }
    }

    /// Materializes the current row into `rec`.
    pub fn deref_into(&self, rec: &mut Record) -> Result<()> {
        assert!(self.valid(), "deref on an invalid scanner");
        let (key, stored) = self.iter.deref();

        match self.index_no {
            None => {
                let pk_vals = decode_values(&key[4..], &self.tdef.types[..self.tdef.pkeys])?;
                let rest = decode_values(stored, &self.tdef.types[self.tdef.pkeys..])?;
                rec.clear();
                for (col, val) in self
                    .tdef
                    .cols
                    .iter()
                    .zip(pk_vals.into_iter().chain(rest))
                {
                    rec.push(col.clone(), val);
                }
            }
            Some(i) => {
                ensure!(
                    stored.is_empty(),
                    "index entry carries a value (corrupt index tree)"
                );
                let index = &self.tdef.indexes[i];
                let types: Vec<DataType> = index
                    .iter()
                    .map(|c| self.tdef.col_type(c).unwrap())
                    .collect();
                let ivals = decode_values(&key[4..], &types)?;

                // pull the primary key out of the entry, then fetch the row
                rec.clear();
                for col in self.tdef.primary_key_cols() {
                    let pos = index.iter().position(|c| c == col).unwrap();
                    rec.push(col.clone(), ivals[pos].clone());
                }
                let found = read_row(self.pages, self.root, &self.tdef, rec)?;
                ensure!(found, "index entry without a matching row");
            }
        }
        Ok(())
    }

    /// Convenience: the current row as a fresh record.
    pub fn row(&self) -> Result<Record> {
        let mut rec = Record::new();
        self.deref_into(&mut rec)?;
        Ok(rec)
    }
}
