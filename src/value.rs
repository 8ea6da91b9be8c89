//! Value codec — serializes arbitrary host values to self-describing byte
//! blobs.
//!
//! Tagged binary format, versioned by a single leading byte per spec §4.4.
//! Unlike the fast-path codec this crate's teacher used for Python
//! primitives (which fell back to pickle for sequences and mappings),
//! `Value` is the complete host-value shape for this crate, so every tag
//! in the spec table is implemented natively — there is no escape hatch.

use crate::error::{Result, StoreError};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_SEQUENCE: u8 = 6;
const TAG_MAPPING: u8 = 7;
const TAG_OPAQUE: u8 = 8;

/// A host value stored in an [`crate::list::EMList`] or [`crate::dict::EMDict`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Opaque(Vec<u8>),
}

/// Encode `value` into `buf`, appending to whatever is already there.
///
/// Encoding a [`Value`] can never fail — every variant is representable.
pub fn encode(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::Int(v) => {
            buf.push(TAG_INT);
            write_varint_zigzag(*v, buf);
        }
        Value::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STRING);
            write_varint(s.len() as u64, buf);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_varint(b.len() as u64, buf);
            buf.extend_from_slice(b);
        }
        Value::Seq(items) => {
            buf.push(TAG_SEQUENCE);
            write_varint(items.len() as u64, buf);
            for item in items {
                encode(item, buf);
            }
        }
        Value::Map(pairs) => {
            buf.push(TAG_MAPPING);
            write_varint(pairs.len() as u64, buf);
            for (k, v) in pairs {
                encode(k, buf);
                encode(v, buf);
            }
        }
        Value::Opaque(b) => {
            buf.push(TAG_OPAQUE);
            write_varint(b.len() as u64, buf);
            buf.extend_from_slice(b);
        }
    }
}

/// Encode a standalone blob (convenience wrapper around [`encode`]).
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode(value, &mut buf);
    buf
}

/// Decode a single [`Value`] from the front of `data`, returning the value
/// and the number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<(Value, usize)> {
    let tag = *data
        .first()
        .ok_or_else(|| StoreError::InvalidValue("empty value blob".into()))?;
    let rest = &data[1..];
    match tag {
        TAG_NULL => Ok((Value::Null, 1)),
        TAG_BOOL => {
            let b = *rest
                .first()
                .ok_or_else(|| StoreError::InvalidValue("truncated bool".into()))?;
            Ok((Value::Bool(b != 0), 2))
        }
        TAG_INT => {
            let (v, n) = read_varint_zigzag(rest)?;
            Ok((Value::Int(v), 1 + n))
        }
        TAG_FLOAT => {
            if rest.len() < 8 {
                return Err(StoreError::InvalidValue("truncated float".into()));
            }
            let v = f64::from_le_bytes(rest[..8].try_into().unwrap());
            Ok((Value::Float(v), 9))
        }
        TAG_STRING => {
            let (len, n) = read_varint(rest)?;
            let len = len as usize;
            let body = rest
                .get(n..n + len)
                .ok_or_else(|| StoreError::InvalidValue("truncated string".into()))?;
            let s = std::str::from_utf8(body)
                .map_err(|e| StoreError::InvalidValue(format!("invalid utf-8: {e}")))?
                .to_string();
            Ok((Value::Str(s), 1 + n + len))
        }
        TAG_BYTES => {
            let (len, n) = read_varint(rest)?;
            let len = len as usize;
            let body = rest
                .get(n..n + len)
                .ok_or_else(|| StoreError::InvalidValue("truncated bytes".into()))?;
            Ok((Value::Bytes(body.to_vec()), 1 + n + len))
        }
        TAG_SEQUENCE => {
            let (count, mut offset) = read_varint(rest)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (v, consumed) = decode(&rest[offset..])?;
                items.push(v);
                offset += consumed;
            }
            Ok((Value::Seq(items), 1 + offset))
        }
        TAG_MAPPING => {
            let (count, mut offset) = read_varint(rest)?;
            let mut pairs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (k, kn) = decode(&rest[offset..])?;
                offset += kn;
                let (v, vn) = decode(&rest[offset..])?;
                offset += vn;
                pairs.push((k, v));
            }
            Ok((Value::Map(pairs), 1 + offset))
        }
        TAG_OPAQUE => {
            let (len, n) = read_varint(rest)?;
            let len = len as usize;
            let body = rest
                .get(n..n + len)
                .ok_or_else(|| StoreError::InvalidValue("truncated opaque".into()))?;
            Ok((Value::Opaque(body.to_vec()), 1 + n + len))
        }
        other => Err(StoreError::InvalidValue(format!(
            "unknown value tag {other}"
        ))),
    }
}

fn write_varint(mut v: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(StoreError::InvalidValue("varint too long".into()));
        }
    }
    Err(StoreError::InvalidValue("truncated varint".into()))
}

fn write_varint_zigzag(v: i64, buf: &mut Vec<u8>) {
    let zigzag = ((v << 1) ^ (v >> 63)) as u64;
    write_varint(zigzag, buf);
}

fn read_varint_zigzag(data: &[u8]) -> Result<(i64, usize)> {
    let (zigzag, n) = read_varint(data)?;
    let v = ((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64);
    Ok((v, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let bytes = encode_value(&v);
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, v);
    }

    #[test]
    fn roundtrips_every_tag() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(-1));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(3.25));
        roundtrip(Value::Str("hello world".into()));
        roundtrip(Value::Bytes(vec![1, 2, 3, 4]));
        roundtrip(Value::Seq(vec![Value::Int(1), Value::Str("a".into())]));
        roundtrip(Value::Map(vec![(
            Value::Str("k".into()),
            Value::Int(42),
        )]));
        roundtrip(Value::Opaque(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn nested_sequence() {
        roundtrip(Value::Seq(vec![
            Value::Seq(vec![Value::Int(1), Value::Int(2)]),
            Value::Map(vec![(Value::Int(1), Value::Bool(true))]),
        ]));
    }

    #[test]
    fn rejects_truncated_blob() {
        let bytes = encode_value(&Value::Str("hello".into()));
        let truncated = &bytes[..bytes.len() - 2];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(decode(&[200]).is_err());
    }

    #[test]
    fn rejects_empty_blob() {
        assert!(decode(&[]).is_err());
    }
}
