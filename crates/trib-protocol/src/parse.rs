//! Incremental reply parser.
//!
//! [`parse_reply`] looks at whatever has been read from the socket so far.
//! It either returns a complete frame together with the number of bytes it
//! consumed, or `Ok(None)` when more data is needed; the buffer itself is
//! never modified, so the caller can append and retry.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Aggregates nested deeper than this are rejected.
const MAX_DEPTH: usize = 32;

/// Upper bound for declared array/map sizes.
const MAX_ELEMENTS: i64 = 1 << 20;

/// Upper bound for a single bulk payload (512 MiB).
const MAX_BULK: i64 = 512 * 1024 * 1024;

/// Cap on up-front `Vec` reservation, however large the declared count.
const RESERVE_CAP: usize = 256;

/// Parses one reply from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` for a complete frame, `Ok(None)`
/// when `buf` ends mid-frame and `Err` for malformed input.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match frame(&mut cursor, 0) {
        Ok(frame) => Ok(Some((frame, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn frame(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    match next_byte(cursor)? {
        b'+' => Ok(Frame::Simple(utf8_line(cursor, "status")?)),
        b'-' => Ok(Frame::Error(utf8_line(cursor, "error")?)),
        b':' => Ok(Frame::Integer(integer_line(cursor)?)),
        b'$' => bulk(cursor),
        b'*' => {
            let Some(count) = aggregate_len(cursor, depth)? else {
                return Ok(Frame::Null);
            };
            let mut items = Vec::with_capacity(count.min(RESERVE_CAP));
            for _ in 0..count {
                items.push(frame(cursor, depth + 1)?);
            }
            Ok(Frame::Array(items))
        }
        b'%' => {
            let Some(count) = aggregate_len(cursor, depth)? else {
                return Ok(Frame::Null);
            };
            let mut pairs = Vec::with_capacity(count.min(RESERVE_CAP));
            for _ in 0..count {
                let key = frame(cursor, depth + 1)?;
                let value = frame(cursor, depth + 1)?;
                pairs.push((key, value));
            }
            Ok(Frame::Map(pairs))
        }
        b'_' => {
            line(cursor)?;
            Ok(Frame::Null)
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

fn bulk(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ProtocolError> {
    let len = integer_line(cursor)?;
    if len == -1 {
        return Ok(Frame::Null);
    }
    if len < 0 {
        return Err(ProtocolError::InvalidFrameLength(len));
    }
    if len > MAX_BULK {
        return Err(ProtocolError::BulkTooLarge(len));
    }

    let len = len as usize;
    let start = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if buf.len() < start + len + 2 {
        return Err(ProtocolError::Incomplete);
    }
    if &buf[start + len..start + len + 2] != b"\r\n" {
        return Err(ProtocolError::InvalidFrameLength(len as i64));
    }

    cursor.set_position((start + len + 2) as u64);
    Ok(Frame::Bulk(Bytes::copy_from_slice(&buf[start..start + len])))
}

/// Reads an array/map header. `None` is the RESP2 nil aggregate (`*-1`).
fn aggregate_len(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Option<usize>, ProtocolError> {
    if depth + 1 > MAX_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_DEPTH));
    }
    let count = integer_line(cursor)?;
    match count {
        -1 => Ok(None),
        n if n < 0 => Err(ProtocolError::InvalidFrameLength(n)),
        n if n > MAX_ELEMENTS => Err(ProtocolError::TooManyElements(n)),
        n => Ok(Some(n as usize)),
    }
}

fn next_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let byte = *cursor.get_ref().get(pos).ok_or(ProtocolError::Incomplete)?;
    cursor.set_position(pos as u64 + 1);
    Ok(byte)
}

/// Returns the bytes before the next CRLF and moves past it.
fn line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf: &'a [u8] = *cursor.get_ref();
    let start = cursor.position() as usize;
    let mut from = start;

    while let Some(offset) = buf.get(from..).and_then(|rest| memchr::memchr(b'\r', rest)) {
        let cr = from + offset;
        if buf.get(cr + 1) == Some(&b'\n') {
            cursor.set_position((cr + 2) as u64);
            return Ok(&buf[start..cr]);
        }
        from = cr + 1;
    }
    Err(ProtocolError::Incomplete)
}

fn utf8_line(cursor: &mut Cursor<&[u8]>, kind: &'static str) -> Result<String, ProtocolError> {
    let raw = line(cursor)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8(kind))
}

fn integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    decimal(line(cursor)?)
}

/// Decodes an optionally negative decimal without going through `str`.
/// Digits are folded toward the sign so `i64::MIN` doesn't overflow.
fn decimal(raw: &[u8]) -> Result<i64, ProtocolError> {
    let (sign, digits) = match raw.split_first() {
        Some((b'-', rest)) => (-1i64, rest),
        Some(_) => (1i64, raw),
        None => return Err(ProtocolError::InvalidInteger),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    digits.iter().try_fold(0i64, |acc, &b| {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(sign * i64::from(b - b'0')))
            .ok_or(ProtocolError::InvalidInteger)
    })
}
