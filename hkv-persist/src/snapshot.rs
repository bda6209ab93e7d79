//! # Snapshot File Format
//!
//! Purpose: A point-in-time dump of a store's live key/value map, used to
//! truncate the append log and bound recovery time.
//!
//! ## Layout
//! Header: `[4-byte magic "HKVS"][4-byte version][8-byte created-at ns]
//!  [8-byte last-applied-sequence][1-byte compressed flag][4-byte header CRC32C]`
//! Body: `[8-byte entry count]` followed by, per entry,
//!  `[varint key len][key][varint tagged-value len][tagged value]
//!   [8-byte expires-at ns, 0 = no ttl][varint session len][session]`,
//! with a trailing `[4-byte body CRC32C]`.

use hkv_common::{HkvError, HkvResult};

const MAGIC: [u8; 4] = *b"HKVS";
const FORMAT_VERSION: u32 = 1;

/// One live entry captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub tagged_value: Vec<u8>,
    pub expires_at_ns: u64,
    pub session: Vec<u8>,
}

/// Deserialized snapshot contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub created_at_ns: u64,
    pub last_applied_sequence: u64,
    pub entries: Vec<SnapshotEntry>,
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

/// Encodes a full snapshot file (header + body), computing both CRCs.
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(snapshot.entries.len() as u64).to_le_bytes());
    for entry in &snapshot.entries {
        write_varint(&mut body, entry.key.len() as u64);
        body.extend_from_slice(&entry.key);
        write_varint(&mut body, entry.tagged_value.len() as u64);
        body.extend_from_slice(&entry.tagged_value);
        body.extend_from_slice(&entry.expires_at_ns.to_le_bytes());
        write_varint(&mut body, entry.session.len() as u64);
        body.extend_from_slice(&entry.session);
    }
    let body_crc = crc32c::crc32c(&body);

    let mut header = Vec::with_capacity(25);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&snapshot.created_at_ns.to_le_bytes());
    header.extend_from_slice(&snapshot.last_applied_sequence.to_le_bytes());
    header.push(0); // compressed flag, reserved
    let header_crc = crc32c::crc32c(&header);

    let mut out = Vec::with_capacity(header.len() + 4 + body.len() + 4);
    out.extend_from_slice(&header);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&body_crc.to_le_bytes());
    out
}

/// Decodes and CRC-validates a full snapshot file.
///
/// Returns `DeserializeError` for a bad magic/version, a header CRC
/// mismatch, or a body CRC mismatch — callers (the recovery path) treat
/// any of these as "corrupted, skip to the next older snapshot".
pub fn decode_snapshot(buf: &[u8]) -> HkvResult<Snapshot> {
    // header: magic(4) version(4) created_at(8) last_applied_sequence(8) compressed(1) = 25
    const HEADER_LEN: usize = 25;
    if buf.len() < HEADER_LEN + 4 + 4 {
        return Err(HkvError::DeserializeError);
    }
    let header = &buf[0..HEADER_LEN];
    if header[0..4] != MAGIC {
        return Err(HkvError::DeserializeError);
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(HkvError::DeserializeError);
    }
    let created_at_ns = u64::from_le_bytes(header[8..16].try_into().unwrap());
    let last_applied_sequence = u64::from_le_bytes(header[16..24].try_into().unwrap());

    let header_crc_stored =
        u32::from_le_bytes(buf[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap());
    if crc32c::crc32c(header) != header_crc_stored {
        return Err(HkvError::DeserializeError);
    }

    let body = &buf[HEADER_LEN + 4..buf.len() - 4];
    let stored_body_crc = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
    if crc32c::crc32c(body) != stored_body_crc {
        return Err(HkvError::DeserializeError);
    }

    let mut pos = 0usize;
    let count = u64::from_le_bytes(
        body.get(0..8)
            .ok_or(HkvError::DeserializeError)?
            .try_into()
            .unwrap(),
    ) as usize;
    pos += 8;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = read_varint(body, &mut pos)? as usize;
        let key = body
            .get(pos..pos + key_len)
            .ok_or(HkvError::DeserializeError)?
            .to_vec();
        pos += key_len;

        let value_len = read_varint(body, &mut pos)? as usize;
        let tagged_value = body
            .get(pos..pos + value_len)
            .ok_or(HkvError::DeserializeError)?
            .to_vec();
        pos += value_len;

        let expires_at_ns = u64::from_le_bytes(
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
        pos += session_len;

        entries.push(SnapshotEntry {
            key,
            tagged_value,
            expires_at_ns,
            session,
        });
    }

    Ok(Snapshot {
        created_at_ns,
        last_applied_sequence,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_round_trips() {
        let snap = Snapshot {
            created_at_ns: 42,
            last_applied_sequence: 7,
            entries: Vec::new(),
        };
        let encoded = encode_snapshot(&snap);
        assert_eq!(decode_snapshot(&encoded).unwrap(), snap);
    }

    #[test]
    fn snapshot_with_entries_round_trips() {
        let snap = Snapshot {
            created_at_ns: 100,
            last_applied_sequence: 55,
            entries: vec![
                SnapshotEntry {
                    key: b"k1".to_vec(),
                    tagged_value: vec![0, b'v'],
                    expires_at_ns: 0,
                    session: b"s1".to_vec(),
                },
                SnapshotEntry {
                    key: b"k2".to_vec(),
                    tagged_value: vec![3, 1, 0, 0, 0],
                    expires_at_ns: 999,
                    session: Vec::new(),
                },
            ],
        };
        let encoded = encode_snapshot(&snap);
        assert_eq!(decode_snapshot(&encoded).unwrap(), snap);
    }

    #[test]
    fn corrupted_snapshot_is_deserialize_error() {
        let snap = Snapshot {
            created_at_ns: 1,
            last_applied_sequence: 1,
            entries: vec![SnapshotEntry {
                key: b"k".to_vec(),
                tagged_value: vec![0],
                expires_at_ns: 0,
                session: Vec::new(),
            }],
        };
        let mut encoded = encode_snapshot(&snap);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert_eq!(decode_snapshot(&encoded).unwrap_err(), HkvError::DeserializeError);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let snap = Snapshot {
            created_at_ns: 1,
            last_applied_sequence: 1,
            entries: Vec::new(),
        };
        let mut encoded = encode_snapshot(&snap);
        encoded[0] = b'X';
        assert_eq!(decode_snapshot(&encoded).unwrap_err(), HkvError::DeserializeError);
    }
}
