//! # AOF Record Format
//!
//! Purpose: Encode/decode a single append-log record exactly as laid out in
//! the design doc, so a record written by one node version can always be
//! replayed, truncated, or CRC-checked independently of the others.
//!
//! ## Layout
//! `[4-byte body length][8-byte sequence][8-byte timestamp ns][1-byte op]
//!  [varint key len][key][varint value len][value]
//!  [8-byte ttl-seconds][varint session len][session][4-byte CRC32C]`
//!
//! The body length field covers everything from `sequence` through the
//! session bytes (everything the CRC also covers); the CRC is computed over
//! that same span so a reader can validate a record before trusting its
//! length to seek past it.

use hkv_common::{HkvError, HkvResult};

/// Operation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set = 0,
    Del = 1,
    Clear = 2,
}

impl Op {
    fn from_u8(byte: u8) -> HkvResult<Self> {
        match byte {
            0 => Ok(Op::Set),
            1 => Ok(Op::Del),
            2 => Ok(Op::Clear),
            _ => Err(HkvError::DeserializeError),
        }
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ttl_secs: u64,
    pub session: Vec<u8>,
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> HkvResult<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(HkvError::DeserializeError)?;
        *pos += 1;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(HkvError::DeserializeError);
        }
    }
    Ok(result)
}

/// Encodes a record including its length prefix, ready to append to a file.
pub fn encode_record(entry: &LogEntry) -> Vec<u8> {
    let mut body = Vec::with_capacity(32 + entry.key.len() + entry.value.len() + entry.session.len());
    body.extend_from_slice(&entry.sequence.to_le_bytes());
    body.extend_from_slice(&entry.timestamp_ns.to_le_bytes());
    body.push(entry.op as u8);
    write_varint(&mut body, entry.key.len() as u64);
    body.extend_from_slice(&entry.key);
    write_varint(&mut body, entry.value.len() as u64);
    body.extend_from_slice(&entry.value);
    body.extend_from_slice(&entry.ttl_secs.to_le_bytes());
    write_varint(&mut body, entry.session.len() as u64);
    body.extend_from_slice(&entry.session);

    let crc = crc32c::crc32c(&body);

    let mut record = Vec::with_capacity(4 + body.len() + 4);
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    record.extend_from_slice(&crc.to_le_bytes());
    record
}

/// Result of attempting to decode one record from a buffer positioned at a
/// record boundary.
pub enum DecodeOutcome {
    /// A full, CRC-valid record, plus the total bytes it consumed.
    Record(LogEntry, usize),
    /// Not enough bytes buffered yet to know the record's full length.
    Incomplete,
    /// The record's CRC did not match; the log should be truncated here.
    CrcMismatch,
}

/// Attempts to decode one record starting at `buf[0]`.
pub fn decode_record(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < 4 {
        return DecodeOutcome::Incomplete;
    }
    let body_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let total_len = 4 + body_len + 4;
    if buf.len() < total_len {
        return DecodeOutcome::Incomplete;
    }

    let body = &buf[4..4 + body_len];
    let stored_crc = u32::from_le_bytes(buf[4 + body_len..total_len].try_into().unwrap());
    if crc32c::crc32c(body) != stored_crc {
        return DecodeOutcome::CrcMismatch;
    }

    match decode_body(body) {
        Ok(entry) => DecodeOutcome::Record(entry, total_len),
        Err(_) => DecodeOutcome::CrcMismatch,
    }
}

fn decode_body(body: &[u8]) -> HkvResult<LogEntry> {
    if body.len() < 17 {
        return Err(HkvError::DeserializeError);
    }
    let sequence = u64::from_le_bytes(body[0..8].try_into().unwrap());
    let timestamp_ns = u64::from_le_bytes(body[8..16].try_into().unwrap());
    let op = Op::from_u8(body[16])?;

    let mut pos = 17;
    let key_len = read_varint(body, &mut pos)? as usize;
    let key = body
        .get(pos..pos + key_len)
        .ok_or(HkvError::DeserializeError)?
        .to_vec();
    pos += key_len;

    let value_len = read_varint(body, &mut pos)? as usize;
    let value = body
        .get(pos..pos + value_len)
        .ok_or(HkvError::DeserializeError)?
        .to_vec();
    pos += value_len;

    let ttl_secs = u64::from_le_bytes(
        body.get(pos..pos + 8)
            .ok_or(HkvError::DeserializeError)?
            .try_into()
            .unwrap(),
    );
    pos += 8;

    let session_len = read_varint(body, &mut pos)? as usize;
    let session = body
        .get(pos..pos + session_len)
        .ok_or(HkvError::DeserializeError)?
        .to_vec();

    Ok(LogEntry {
        sequence,
        timestamp_ns,
        op,
        key,
        value,
        ttl_secs,
        session,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, op: Op) -> LogEntry {
        LogEntry {
            sequence: seq,
            timestamp_ns: 12345,
            op,
            key: b"key".to_vec(),
            value: b"value".to_vec(),
            ttl_secs: 60,
            session: b"sess-1".to_vec(),
        }
    }

    #[test]
    fn record_round_trips() {
        let entry = sample(1, Op::Set);
        let encoded = encode_record(&entry);
        match decode_record(&encoded) {
            DecodeOutcome::Record(decoded, len) => {
                assert_eq!(decoded, entry);
                assert_eq!(len, encoded.len());
            }
            _ => panic!("expected a decoded record"),
        }
    }

    #[test]
    fn del_and_clear_have_empty_value() {
        for op in [Op::Del, Op::Clear] {
            let mut entry = sample(2, op);
            entry.value.clear();
            let encoded = encode_record(&entry);
            match decode_record(&encoded) {
                DecodeOutcome::Record(decoded, _) => assert!(decoded.value.is_empty()),
                _ => panic!("expected a decoded record"),
            }
        }
    }

    #[test]
    fn truncated_buffer_is_incomplete() {
        let entry = sample(1, Op::Set);
        let encoded = encode_record(&entry);
        assert!(matches!(
            decode_record(&encoded[..encoded.len() - 3]),
            DecodeOutcome::Incomplete
        ));
    }

    #[test]
    fn corrupted_crc_is_detected() {
        let entry = sample(1, Op::Set);
        let mut encoded = encode_record(&entry);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(decode_record(&encoded), DecodeOutcome::CrcMismatch));
    }
}
