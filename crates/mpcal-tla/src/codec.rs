//! Canonical binary encoding of [`Value`]s.
//!
//! This is the wire representation carried inside mailbox and monitor
//! frames. The encoding is canonical: aggregates are written in the value
//! total order (sets ascending, function entries by ascending key), so two
//! structurally equal values always produce identical bytes, and decoding
//! the bytes yields a structurally equal value.
//!
//! Layout, per value:
//!
//! ```text
//! +-----+---------------------------------------------------------+
//! | tag | payload                                                 |
//! +-----+---------------------------------------------------------+
//!   0x00  Bool      u8 (0 or 1)
//!   0x01  Number    i64, big-endian
//!   0x02  String    u32 length (BE) || UTF-8 bytes
//!   0x03  Set       u32 count  (BE) || elements, ascending
//!   0x04  Tuple     u32 count  (BE) || elements, in order
//!   0x05  Function  u32 count  (BE) || (key || value) pairs, by key
//! ```
//!
//! Decoding is defensive: every length is validated against the remaining
//! input before any allocation, and nesting depth is capped so crafted
//! input cannot overflow the stack.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::value::Value;

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DECODE_DEPTH: usize = 64;

const TAG_BOOL: u8 = 0x00;
const TAG_NUMBER: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_SET: u8 = 0x03;
const TAG_TUPLE: u8 = 0x04;
const TAG_FUNCTION: u8 = 0x05;

/// Decoding failure. Any of these on a network payload is a peer bug or
/// corruption, never something the runtime retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Unknown variant tag.
    #[error("invalid value tag {0:#04x}")]
    InvalidTag(u8),

    /// Boolean payload other than 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// String payload was not UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// Nesting exceeded [`MAX_DECODE_DEPTH`].
    #[error("value nesting exceeds depth limit {MAX_DECODE_DEPTH}")]
    DepthExceeded,

    /// A full decode left unconsumed bytes.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// An aggregate too large to encode (length above `u32::MAX`).
    #[error("aggregate of {0} elements exceeds the wire limit")]
    TooLarge(usize),
}

impl Value {
    /// Append the canonical encoding of `self` to `buf`.
    ///
    /// # Errors
    ///
    /// Fails only when an aggregate exceeds the `u32` length limit.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Self::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            },
            Self::Number(n) => {
                buf.put_u8(TAG_NUMBER);
                buf.put_i64(*n);
            },
            Self::String(s) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32(wire_len(s.len())?);
                buf.put_slice(s.as_bytes());
            },
            Self::Set(elems) => {
                buf.put_u8(TAG_SET);
                buf.put_u32(wire_len(elems.len())?);
                // BTreeSet iterates ascending: canonical by construction.
                for elem in elems.iter() {
                    elem.encode(buf)?;
                }
            },
            Self::Tuple(elems) => {
                buf.put_u8(TAG_TUPLE);
                buf.put_u32(wire_len(elems.len())?);
                for elem in elems.iter() {
                    elem.encode(buf)?;
                }
            },
            Self::Function(map) => {
                buf.put_u8(TAG_FUNCTION);
                buf.put_u32(wire_len(map.len())?);
                for (k, v) in map.iter() {
                    k.encode(buf)?;
                    v.encode(buf)?;
                }
            },
        }
        Ok(())
    }

    /// The canonical encoding of `self` as a fresh buffer.
    ///
    /// # Errors
    ///
    /// Fails only when an aggregate exceeds the `u32` length limit.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one value from `input`, requiring that it consume the whole
    /// slice.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed, truncated, or trailing input.
    pub fn from_bytes(input: &[u8]) -> Result<Value, CodecError> {
        let mut cursor = input;
        let value = decode_value(&mut cursor, 0)?;
        if cursor.is_empty() {
            Ok(value)
        } else {
            Err(CodecError::TrailingBytes(cursor.len()))
        }
    }

    /// Decode one value from the front of `cursor`, advancing it past the
    /// consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed or truncated input.
    pub fn decode(cursor: &mut &[u8]) -> Result<Value, CodecError> {
        decode_value(cursor, 0)
    }
}

fn wire_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if cursor.len() < n {
        return Err(CodecError::UnexpectedEof);
    }
    let (head, rest) = cursor.split_at(n);
    *cursor = rest;
    Ok(head)
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(take(cursor, 1)?[0])
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32, CodecError> {
    let bytes = take(cursor, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_i64(cursor: &mut &[u8]) -> Result<i64, CodecError> {
    let bytes = take(cursor, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(raw))
}

fn decode_value(cursor: &mut &[u8], depth: usize) -> Result<Value, CodecError> {
    if depth >= MAX_DECODE_DEPTH {
        return Err(CodecError::DepthExceeded);
    }
    match take_u8(cursor)? {
        TAG_BOOL => match take_u8(cursor)? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(CodecError::InvalidBool(other)),
        },
        TAG_NUMBER => Ok(Value::Number(take_i64(cursor)?)),
        TAG_STRING => {
            let len = take_u32(cursor)? as usize;
            let bytes = take(cursor, len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(Value::string(s))
        },
        TAG_SET => {
            let count = take_u32(cursor)? as usize;
            // Every element occupies at least one tag byte, so a count
            // beyond the remaining input is malformed; reject it before
            // reserving anything.
            if count > cursor.len() {
                return Err(CodecError::UnexpectedEof);
            }
            let mut elems = BTreeSet::new();
            for _ in 0..count {
                elems.insert(decode_value(cursor, depth + 1)?);
            }
            Ok(Value::Set(Arc::new(elems)))
        },
        TAG_TUPLE => {
            let count = take_u32(cursor)? as usize;
            if count > cursor.len() {
                return Err(CodecError::UnexpectedEof);
            }
            let mut elems = Vec::with_capacity(count);
            for _ in 0..count {
                elems.push(decode_value(cursor, depth + 1)?);
            }
            Ok(Value::Tuple(Arc::new(elems)))
        },
        TAG_FUNCTION => {
            let count = take_u32(cursor)? as usize;
            if count > cursor.len() {
                return Err(CodecError::UnexpectedEof);
            }
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = decode_value(cursor, depth + 1)?;
                let value = decode_value(cursor, depth + 1)?;
                map.insert(key, value);
            }
            Ok(Value::Function(Arc::new(map)))
        },
        other => Err(CodecError::InvalidTag(other)),
    }
}
