//! Errors raised while decoding replies.

use thiserror::Error;

/// Ways a reply byte stream can be malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes buffered for a full frame yet. Never surfaced by
    /// [`parse_reply`](crate::parse_reply), which maps it to `Ok(None)`.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The leading type byte is not one the parser understands.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// A length or integer line did not hold a decimal number.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A declared length was negative (other than the nil marker) or the
    /// payload was not followed by CRLF.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk string declared more bytes than we are willing to buffer.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(i64),

    /// An array or map declared more elements than we are willing to hold.
    #[error("too many elements: {0}")]
    TooManyElements(i64),

    /// Aggregates nested deeper than the parser allows.
    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A status or error line was not valid UTF-8.
    #[error("invalid utf-8 in {0} line")]
    InvalidUtf8(&'static str),
}
