//! RFC 4251 §5 wire primitives: big-endian integers and length-prefixed
//! opaque strings, read from an advancing byte-slice cursor.
//!
//! Readers return `None` when the buffer does not hold a complete value,
//! without consuming anything. Callers decide whether "not enough bytes"
//! means end-of-record (PEM field walk) or a protocol error (response
//! decoding).

use crate::error::AgentError;

/// Read a single byte.
pub fn read_u8(buf: &mut &[u8]) -> Option<u8> {
    let (&b, rest) = buf.split_first()?;
    *buf = rest;
    Some(b)
}

/// Read a big-endian unsigned 32-bit integer.
pub fn read_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    *buf = rest;
    Some(u32::from_be_bytes(raw))
}

/// Read one length-prefixed string, yielding the payload bytes.
///
/// The cursor is only advanced when the prefix and the full payload are
/// both present.
pub fn read_string<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.len() < 4 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    let len = u32::from_be_bytes(raw) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let (s, rest) = buf[4..].split_at(len);
    *buf = rest;
    Some(s)
}

/// Read one length-prefixed string and decode it as UTF-8.
///
/// `Ok(None)` means the buffer is short; invalid UTF-8 is a hard error.
pub fn read_utf8(buf: &mut &[u8]) -> Result<Option<String>, AgentError> {
    let Some(s) = read_string(buf) else {
        return Ok(None);
    };
    String::from_utf8(s.to_vec())
        .map(Some)
        .map_err(|_| AgentError::BadResponse("string is not valid utf-8".into()))
}

/// Append a big-endian unsigned 32-bit integer.
pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a length-prefixed string.
pub fn write_string(out: &mut Vec<u8>, s: &[u8]) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s);
}
