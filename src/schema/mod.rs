//! # Schema Catalog
//!
//! Table definitions and the two internal tables that persist them.
//!
//! A [`TableDef`] names its columns, their types, how many leading columns
//! form the primary key, and any secondary indexes. Every tree a table owns
//! (one primary, one per index) is assigned a 4-byte key prefix, drawn from
//! a monotonic counter, so all of them share the one B+tree file without
//! collisions.
//!
//! ## Internal Tables
//!
//! Two definitions are built in and never stored in the catalog itself:
//!
//! - `@meta` (prefix 1): byte key-value pairs; holds the `next_prefix`
//!   counter.
//! - `@table` (prefix 2): table name to JSON-encoded [`TableDef`].
//!
//! User tables take prefixes from [`TABLE_PREFIX_MIN`] upward.

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::records::DataType;

pub const META_TABLE: &str = "@meta";
pub const CATALOG_TABLE: &str = "@table";

pub const META_PREFIX: u32 = 1;
pub const CATALOG_PREFIX: u32 = 2;
pub const TABLE_PREFIX_MIN: u32 = 3;

/// A table definition: column layout, primary key width, secondary indexes,
/// and the key prefixes assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub cols: Vec<String>,
    pub types: Vec<DataType>,
    /// The first `pkeys` columns form the primary key.
    pub pkeys: usize,
    /// Secondary indexes by column name. Validation appends the primary-key
    /// columns an index is missing, so every entry maps to a full row.
    pub indexes: Vec<Vec<String>>,
    /// Key prefix of the primary tree; 0 until the table is created.
    pub prefix: u32,
    /// Key prefix per secondary index, parallel to `indexes`.
    pub index_prefixes: Vec<u32>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cols: Vec::new(),
            types: Vec::new(),
            pkeys: 0,
            indexes: Vec::new(),
            prefix: 0,
            index_prefixes: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: DataType) -> Self {
        self.cols.push(name.into());
        self.types.push(ty);
        self
    }

    /// Declares the first `n` columns as the primary key.
    pub fn primary_keys(mut self, n: usize) -> Self {
        self.pkeys = n;
        self
    }

    pub fn index<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.indexes.push(cols.into_iter().map(Into::into).collect());
        self
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c == name)
    }

    pub fn col_type(&self, name: &str) -> Option<DataType> {
        self.col_index(name).map(|i| self.types[i])
    }

    pub fn primary_key_cols(&self) -> &[String] {
        &self.cols[..self.pkeys]
    }

    /// Validates the definition and completes each secondary index with the
    /// primary-key columns it lacks. Called once, at table creation.
    pub fn validate(&mut self) -> Result<()> {
        ensure!(!self.name.is_empty(), "table name must not be empty");
        ensure!(
            !self.cols.is_empty(),
            "table '{}' must have at least one column",
            self.name
        );
        ensure!(
            self.cols.len() == self.types.len(),
            "table '{}': {} columns but {} types",
            self.name,
            self.cols.len(),
            self.types.len()
        );
        ensure!(
            self.pkeys >= 1 && self.pkeys <= self.cols.len(),
            "table '{}': invalid primary key width {}",
            self.name,
            self.pkeys
        );
        for i in 0..self.cols.len() {
            for j in i + 1..self.cols.len() {
                ensure!(
                    self.cols[i] != self.cols[j],
                    "table '{}': duplicate column '{}'",
                    self.name,
                    self.cols[i]
                );
            }
        }
        ensure!(
            self.prefix == 0 && self.index_prefixes.is_empty(),
            "table '{}' already has prefixes assigned",
            self.name
        );

        for index in &mut self.indexes {
            ensure!(!index.is_empty(), "table '{}': empty index", self.name);
            for col in index.iter() {
                ensure!(
                    self.cols.contains(col),
                    "table '{}': index column '{col}' does not exist",
                    self.name
                );
            }
            for i in 0..index.len() {
                for j in i + 1..index.len() {
                    ensure!(
                        index[i] != index[j],
                        "table '{}': duplicate index column '{}'",
                        self.name,
                        index[i]
                    );
                }
            }
            // complete the index so each entry carries the full primary key
            for pk in &self.cols[..self.pkeys] {
                if !index.contains(pk) {
                    index.push(pk.clone());
                }
            }
        }
        Ok(())
    }
}

/// Definition of the `@meta` internal table.
pub fn meta_table() -> TableDef {
    TableDef {
        name: META_TABLE.to_string(),
        cols: vec!["key".to_string(), "val".to_string()],
        types: vec![DataType::Bytes, DataType::Bytes],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: META_PREFIX,
        index_prefixes: Vec::new(),
    }
}

/// Definition of the `@table` internal table.
pub fn catalog_table() -> TableDef {
    TableDef {
        name: CATALOG_TABLE.to_string(),
        cols: vec!["name".to_string(), "def".to_string()],
        types: vec![DataType::Bytes, DataType::Bytes],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: CATALOG_PREFIX,
        index_prefixes: Vec::new(),
    }
}

pub fn to_json(tdef: &TableDef) -> Result<Vec<u8>> {
    serde_json::to_vec(tdef).map_err(Into::into)
}

pub fn from_json(bytes: &[u8]) -> Result<TableDef> {
    serde_json::from_slice(bytes).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .column("id", DataType::Int64)
            .column("name", DataType::Bytes)
            .column("age", DataType::Int64)
            .primary_keys(1)
    }

    #[test]
    fn valid_definition_passes() {
        let mut tdef = users();

        assert!(tdef.validate().is_ok());
    }

    #[test]
    fn indexes_are_completed_with_primary_key_columns() {
        let mut tdef = users().index(["age"]);

        tdef.validate().unwrap();

        assert_eq!(tdef.indexes[0], vec!["age".to_string(), "id".to_string()]);
    }

    #[test]
    fn index_already_containing_the_pk_is_unchanged() {
        let mut tdef = users().index(["age", "id"]);

        tdef.validate().unwrap();

        assert_eq!(tdef.indexes[0], vec!["age".to_string(), "id".to_string()]);
    }

    #[test]
    fn zero_columns_is_rejected() {
        let mut tdef = TableDef::new("empty").primary_keys(1);

        assert!(tdef.validate().is_err());
    }

    #[test]
    fn primary_key_width_must_be_in_range() {
        let mut none = users();
        none.pkeys = 0;
        assert!(none.validate().is_err());

        let mut wide = users();
        wide.pkeys = 4;
        assert!(wide.validate().is_err());
    }

    #[test]
    fn unknown_index_column_is_rejected() {
        let mut tdef = users().index(["salary"]);

        let err = tdef.validate().unwrap_err();

        assert!(err.to_string().contains("salary"));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let mut tdef = TableDef::new("dup")
            .column("x", DataType::Int64)
            .column("x", DataType::Bytes)
            .primary_keys(1);

        assert!(tdef.validate().is_err());
    }

    #[test]
    fn definitions_roundtrip_through_json() {
        let mut tdef = users().index(["age"]);
        tdef.validate().unwrap();
        tdef.prefix = 7;
        tdef.index_prefixes = vec![8];

        let json = to_json(&tdef).unwrap();
        let back = from_json(&json).unwrap();

        assert_eq!(back, tdef);
    }

    #[test]
    fn internal_tables_use_reserved_prefixes() {
        assert_eq!(meta_table().prefix, META_PREFIX);
        assert_eq!(catalog_table().prefix, CATALOG_PREFIX);
        assert!(TABLE_PREFIX_MIN > CATALOG_PREFIX);
    }
}
