//! Reply frame types.

use bytes::Bytes;

/// One decoded reply from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR Slot 5 is already busy\r\n`.
    Error(String),

    /// Integer reply, e.g. `:42\r\n`.
    Integer(i64),

    /// Binary-safe string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Array of nested replies.
    Array(Vec<Frame>),

    /// Nil: `_\r\n` in RESP3, `$-1\r\n` or `*-1\r\n` in RESP2.
    Null,

    /// RESP3 map, kept as ordered pairs.
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }

    /// Text content of a status or bulk reply.
    ///
    /// Bulk data that isn't valid UTF-8 is converted lossily; every other
    /// variant yields `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Integer content. Numeric bulk strings are accepted too, since some
    /// proxies answer counters that way.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Bulk(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}
