//! # Typed Records
//!
//! The relational layer's value model: a [`Record`] is an ordered list of
//! named, typed cells. Two column types exist — variable-length byte
//! strings and signed 64-bit integers — and the [`encode`] module maps
//! tuples of them onto byte strings whose lexicographic order matches the
//! typed order, which is what lets a single B+tree host every table and
//! index.

pub mod encode;

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};

/// Column type tags. The discriminants are part of the persisted schema
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bytes = 1,
    Int64 = 2,
}

/// One table cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int64(i64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bytes(_) => DataType::Bytes,
            Value::Int64(_) => DataType::Int64,
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Int64(_) => bail!("value is an int64, not bytes"),
        }
    }

    pub fn as_int64(&self) -> Result<i64> {
        match self {
            Value::Int64(v) => Ok(*v),
            Value::Bytes(_) => bail!("value is bytes, not an int64"),
        }
    }
}

/// A table row (or part of one): parallel column names and values in the
/// order the caller supplied them. The relational layer reorders records
/// into schema order before encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    cols: Vec<String>,
    vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a bytes column, replacing any existing cell of the same name.
    pub fn set_bytes(&mut self, col: &str, val: impl Into<Vec<u8>>) -> &mut Self {
        self.set(col, Value::Bytes(val.into()))
    }

    /// Sets an int64 column, replacing any existing cell of the same name.
    pub fn set_int64(&mut self, col: &str, val: i64) -> &mut Self {
        self.set(col, Value::Int64(val))
    }

    pub fn set(&mut self, col: &str, val: Value) -> &mut Self {
        if let Some(i) = self.cols.iter().position(|c| c == col) {
            self.vals[i] = val;
        } else {
            self.cols.push(col.to_string());
            self.vals.push(val);
        }
        self
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c == col)
            .map(|i| &self.vals[i])
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn vals(&self) -> &[Value] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    pub(crate) fn from_parts(cols: Vec<String>, vals: Vec<Value>) -> Self {
        debug_assert_eq!(cols.len(), vals.len());
        Self { cols, vals }
    }

    pub(crate) fn clear(&mut self) {
        self.cols.clear();
        self.vals.clear();
    }

    pub(crate) fn push(&mut self, col: String, val: Value) {
        self.cols.push(col);
        self.vals.push(val);
    }
}
