//! # RESP2 Wire Protocol
//!
//! Purpose: Parse client commands (inline or multi-bulk) out of a connection's
//! read buffer and encode responses back, independent of what a command
//! actually does (see `dispatch`).
//!
//! ## Design Principles
//! 1. **Buffer-Owned Parsing**: `RespParser::parse` only ever consumes
//!    complete frames from the front of `BytesMut`; an incomplete frame
//!    leaves the buffer untouched so the caller can read more and retry.
//! 2. **Inline Commands Too**: a line with no leading `*` is split on
//!    whitespace, matching `redis-cli`'s raw-mode behavior and simple
//!    health-check probes that don't speak multi-bulk.
//! 3. **Encoders Are Free Functions**: response encoding has no state, so it
//!    lives as plain functions dispatch.rs calls directly.

use bytes::{Buf, BytesMut};

/// Protocol-level parse failure; anything else is a successful frame or "not
/// enough bytes yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

#[derive(Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Attempts to parse one complete command from the front of `buf`.
    /// Returns `Ok(None)` when `buf` holds an incomplete frame; the caller
    /// should read more bytes and call again. Consumes the parsed bytes from
    /// `buf` on success.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }

        if buf[0] == b'*' {
            parse_multi_bulk(buf)
        } else {
            parse_inline(buf)
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    let Some(pos) = find_crlf(buf) else {
        if buf.len() > 64 * 1024 {
            return Err(RespError::Protocol);
        }
        return Ok(None);
    };
    let line = buf.split_to(pos).to_vec();
    buf.advance(2);
    let args = line
        .split(|&b| b == b' ')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_vec())
        .collect();
    Ok(Some(args))
}

fn parse_multi_bulk(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    let Some(header_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let count = parse_i64(&buf[1..header_end])?;
    if count < 0 {
        buf.advance(header_end + 2);
        return Ok(Some(Vec::new()));
    }
    let count = count as usize;

    let mut cursor = header_end + 2;
    let mut args = Vec::with_capacity(count);

    for _ in 0..count {
        let Some(rel) = find_crlf(&buf[cursor..]) else {
            return Ok(None);
        };
        if buf.get(cursor) != Some(&b'$') {
            return Err(RespError::Protocol);
        }
        let len = parse_i64(&buf[cursor + 1..cursor + rel])?;
        if len < 0 {
            return Err(RespError::Protocol);
        }
        let len = len as usize;
        let data_start = cursor + rel + 2;
        let data_end = data_start + len;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RespError::Protocol);
        }
        args.push(buf[data_start..data_end].to_vec());
        cursor = data_end + 2;
    }

    buf.advance(cursor);
    Ok(Some(args))
}

fn parse_i64(digits: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(RespError::Protocol)
}

pub fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.push(b'+');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.push(b'-');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b':');
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'*');
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(item);
    }
    buf
}

pub fn resp_moved(slot: u16, owner_addr: &str) -> Vec<u8> {
    resp_error(&format!("MOVED {} {}", slot, owner_addr))
}

pub fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

pub fn parse_u64(arg: &[u8]) -> Result<u64, ()> {
    if arg.is_empty() {
        return Err(());
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(());
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_bulk_set_command() {
        let mut buf = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"[..]);
        let mut parser = RespParser::new();
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_multi_bulk_returns_none_without_consuming() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert!(!buf.is_empty());
    }

    #[test]
    fn parses_inline_command() {
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        let mut parser = RespParser::new();
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"PING".to_vec()]);
    }

    #[test]
    fn rejects_malformed_bulk_length() {
        let mut buf = BytesMut::from(&b"*1\r\n$x\r\nGET\r\n"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf), Err(RespError::Protocol));
    }

    #[test]
    fn parses_two_pipelined_commands_in_sequence() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        let mut parser = RespParser::new();
        let first = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first, vec![b"PING".to_vec()]);
        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(second, vec![b"PING".to_vec()]);
        assert!(buf.is_empty());
    }
}
