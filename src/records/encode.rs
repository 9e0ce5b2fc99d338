//! # Order-Preserving Tuple Encoding
//!
//! Encodes typed tuples into byte strings that compare correctly under
//! plain `memcmp`, so the B+tree never needs type information.
//!
//! ## Per-Column Rules
//!
//! - `Int64 v`: eight big-endian bytes of `v` with the sign bit flipped,
//!   so the unsigned byte order matches signed integer order.
//! - `Bytes s`: the escaped form of `s` followed by a single `0x00`
//!   terminator. Escaping rewrites `0x00 -> 0x01 0x01` and
//!   `0x01 -> 0x01 0x02`, which keeps the terminator unambiguous while
//!   preserving order. When the first byte of `s` is `0xfe` or `0xff`, a
//!   two-byte marker `0xfe, s[0]` is emitted first: no encoding then starts
//!   with `0xff`, reserving it as the synthetic maximum for range bounds.
//!
//! ## Keys
//!
//! A key is a 4-byte big-endian table/index prefix followed by the encoded
//! key columns, making keys directly comparable and scoped per tree. Range
//! seeks over partially bound keys pad the unbound suffix with nothing (the
//! empty encoding is the minimum) or with explicit maxima — a lone `0xff`
//! for bytes columns, eight `0xff` for int64 — depending on the relation's
//! direction.
//!
//! Decoding inverts everything and treats malformed input as corruption,
//! not a caller error: encoded bytes come back off disk.

use eyre::{bail, ensure, Result};

use super::{DataType, Value};
use crate::btree::Cmp;

/// Appends the order-preserving encoding of `vals` to `out`.
pub fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for val in vals {
        match val {
            Value::Int64(v) => {
                let flipped = (*v as u64) ^ (1 << 63);
                out.extend_from_slice(&flipped.to_be_bytes());
            }
            Value::Bytes(s) => {
                escape_bytes(out, s);
                out.push(0x00);
            }
        }
    }
}

/// Escapes `s` so the result contains no `0x00` and never starts with
/// `0xff`.
fn escape_bytes(out: &mut Vec<u8>, s: &[u8]) {
    let mut rest = s;
    if let Some(&first) = s.first() {
        if first >= 0xfe {
            out.push(0xfe);
            out.push(first);
            rest = &s[1..];
        }
    }
    for &b in rest {
        if b <= 0x01 {
            out.push(0x01);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
}

/// Decodes `types.len()` values from `input`. Returns the values and the
/// number of bytes consumed.
pub fn decode_values(input: &[u8], types: &[DataType]) -> Result<Vec<Value>> {
    let mut vals = Vec::with_capacity(types.len());
    let mut pos = 0;
    for ty in types {
        match ty {
            DataType::Int64 => {
                ensure!(pos + 8 <= input.len(), "truncated int64 column");
                let raw = u64::from_be_bytes(input[pos..pos + 8].try_into().unwrap());
                vals.push(Value::Int64((raw ^ (1 << 63)) as i64));
                pos += 8;
            }
            DataType::Bytes => {
                let (bytes, consumed) = unescape_bytes(&input[pos..])?;
                vals.push(Value::Bytes(bytes));
                pos += consumed;
            }
        }
    }
    ensure!(pos == input.len(), "trailing bytes after the last column");
    Ok(vals)
}

/// Inverts [`escape_bytes`] up to and including the `0x00` terminator.
/// Returns the decoded bytes and the encoded length consumed.
fn unescape_bytes(input: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;

    if input.first() == Some(&0xfe) {
        ensure!(input.len() >= 2, "truncated first-byte marker");
        out.push(input[1]);
        pos = 2;
    }
    loop {
        match input.get(pos).copied() {
            None => bail!("unterminated bytes column"),
            Some(0x00) => return Ok((out, pos + 1)),
            Some(0x01) => {
                let next = *input.get(pos + 1).ok_or_else(|| eyre::eyre!("truncated escape"))?;
                ensure!(next == 0x01 || next == 0x02, "invalid escape sequence {next:#04x}");
                out.push(next - 1);
                pos += 2;
            }
            Some(b) => {
                out.push(b);
                pos += 1;
            }
        }
    }
}

/// Encodes a complete key: 4-byte big-endian prefix plus the key columns.
pub fn encode_key(prefix: u32, vals: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16 * vals.len());
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(&mut out, vals);
    out
}

/// Encodes a range bound from a partially bound key. `types` lists the
/// column types of the whole key; only the first `vals.len()` are bound.
/// For relations that need the upper end of the unbound space (`<=`, `>`),
/// the suffix is padded with explicit maxima; the others need nothing, the
/// empty encoding already being the minimum.
pub fn encode_key_partial(prefix: u32, vals: &[Value], types: &[DataType], cmp: Cmp) -> Vec<u8> {
    let mut out = encode_key(prefix, vals);
    if cmp == Cmp::Gt || cmp == Cmp::Le {
        for ty in &types[vals.len()..] {
            match ty {
                DataType::Bytes => {
                    // nothing sorts above 0xff, so later columns are moot
                    out.push(0xff);
                    break;
                }
                DataType::Int64 => {
                    // the maximum int64 encoding is exactly eight 0xff
                    // bytes, which a real key can tie; keep padding
                    out.extend_from_slice(&[0xff; 8]);
                }
            }
        }
    }
    out
}
