//! # Tagged Value Wire Format
//!
//! Purpose: Serialize typed cache values into a single compact buffer that
//! carries its own type tag, so the store can round-trip strings, numbers,
//! booleans, and raw bytes without a general-purpose object serializer that
//! would otherwise leak language-level type identifiers onto disk and wire.
//!
//! ## Design Principles
//! 1. **Compact Tagged Union**: One leading byte selects the encoding; the
//!    remaining bytes are the payload, no framing beyond that.
//! 2. **Zero-Copy Friendly**: Encoding is plain byte pushes; decoding borrows
//!    where it can and only allocates for `String`/`Bytes`/`Opaque`.
//! 3. **Fail Fast on Unknown Tags**: An unrecognized tag byte is a
//!    `DeserializeError`, never a silent default.

use crate::error::{HkvError, HkvResult};

/// Type tag prefixed to every serialized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    String = 0,
    Bytes = 1,
    I32 = 2,
    I64 = 3,
    U32 = 4,
    U64 = 5,
    F32 = 6,
    F64 = 7,
    Bool = 8,
    Opaque = 9,
}

impl ValueTag {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => ValueTag::String,
            1 => ValueTag::Bytes,
            2 => ValueTag::I32,
            3 => ValueTag::I64,
            4 => ValueTag::U32,
            5 => ValueTag::U64,
            6 => ValueTag::F32,
            7 => ValueTag::F64,
            8 => ValueTag::Bool,
            9 => ValueTag::Opaque,
            _ => return None,
        })
    }
}

/// A typed cache value, decoded from its tagged-union wire form.
///
/// `Opaque` carries an application-defined byte blob whose interpretation is
/// left to the caller (e.g. a client-side serialized struct); the store
/// treats it identically to `Bytes` except for the tag it reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bytes(Vec<u8>),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Opaque(Vec<u8>),
}

impl Value {
    /// Returns the wire tag for this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::String(_) => ValueTag::String,
            Value::Bytes(_) => ValueTag::Bytes,
            Value::I32(_) => ValueTag::I32,
            Value::I64(_) => ValueTag::I64,
            Value::U32(_) => ValueTag::U32,
            Value::U64(_) => ValueTag::U64,
            Value::F32(_) => ValueTag::F32,
            Value::F64(_) => ValueTag::F64,
            Value::Bool(_) => ValueTag::Bool,
            Value::Opaque(_) => ValueTag::Opaque,
        }
    }

    /// Encodes this value into a single tagged buffer: `[tag][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload_len_hint());
        out.push(self.tag() as u8);
        match self {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out.push(if *v { 1 } else { 0 }),
            Value::Opaque(b) => out.extend_from_slice(b),
        }
        out
    }

    fn payload_len_hint(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::Bytes(b) | Value::Opaque(b) => b.len(),
            Value::Bool(_) => 1,
            _ => 8,
        }
    }

    /// Decodes a tagged buffer produced by [`Value::encode`].
    ///
    /// Returns `HkvError::DeserializeError` for an unknown tag or a payload
    /// whose length does not match the fixed-width encodings.
    pub fn decode(buf: &[u8]) -> HkvResult<Value> {
        let (&tag_byte, payload) = buf.split_first().ok_or(HkvError::DeserializeError)?;
        let tag = ValueTag::from_u8(tag_byte).ok_or(HkvError::DeserializeError)?;
        Ok(match tag {
            ValueTag::String => {
                Value::String(String::from_utf8(payload.to_vec()).map_err(|_| HkvError::DeserializeError)?)
            }
            ValueTag::Bytes => Value::Bytes(payload.to_vec()),
            ValueTag::I32 => Value::I32(i32::from_le_bytes(fixed(payload)?)),
            ValueTag::I64 => Value::I64(i64::from_le_bytes(fixed(payload)?)),
            ValueTag::U32 => Value::U32(u32::from_le_bytes(fixed(payload)?)),
            ValueTag::U64 => Value::U64(u64::from_le_bytes(fixed(payload)?)),
            ValueTag::F32 => Value::F32(f32::from_le_bytes(fixed(payload)?)),
            ValueTag::F64 => Value::F64(f64::from_le_bytes(fixed(payload)?)),
            ValueTag::Bool => {
                let byte = payload.first().ok_or(HkvError::DeserializeError)?;
                Value::Bool(*byte != 0)
            }
            ValueTag::Opaque => Value::Opaque(payload.to_vec()),
        })
    }

    /// Renders the value as a RESP bulk-string payload (what `GET` returns).
    pub fn as_bulk_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) | Value::Opaque(b) => b.clone(),
            Value::I32(v) => v.to_string().into_bytes(),
            Value::I64(v) => v.to_string().into_bytes(),
            Value::U32(v) => v.to_string().into_bytes(),
            Value::U64(v) => v.to_string().into_bytes(),
            Value::F32(v) => v.to_string().into_bytes(),
            Value::F64(v) => v.to_string().into_bytes(),
            Value::Bool(v) => if *v { b"1".to_vec() } else { b"0".to_vec() },
        }
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> HkvResult<[u8; N]> {
    payload.try_into().map_err(|_| HkvError::DeserializeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips() {
        let value = Value::String("hello".to_string());
        let encoded = value.encode();
        assert_eq!(Value::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn numeric_round_trips() {
        for value in [
            Value::I32(-7),
            Value::I64(i64::MIN),
            Value::U32(42),
            Value::U64(u64::MAX),
            Value::F32(1.5),
            Value::F64(-2.25),
            Value::Bool(true),
            Value::Bool(false),
        ] {
            let encoded = value.encode();
            assert_eq!(Value::decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn opaque_and_bytes_round_trip() {
        let value = Value::Bytes(vec![1, 2, 3, 255]);
        assert_eq!(Value::decode(&value.encode()).unwrap(), value);
        let value = Value::Opaque(vec![9, 9]);
        assert_eq!(Value::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn unknown_tag_is_deserialize_error() {
        let buf = vec![200u8, 1, 2, 3];
        assert_eq!(Value::decode(&buf).unwrap_err(), HkvError::DeserializeError);
    }

    #[test]
    fn truncated_fixed_width_payload_errors() {
        let buf = vec![ValueTag::I64 as u8, 1, 2, 3];
        assert_eq!(Value::decode(&buf).unwrap_err(), HkvError::DeserializeError);
    }
}
