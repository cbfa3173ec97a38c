//! trib-protocol: the RESP wire layer used to talk to cluster nodes.
//!
//! Nodes may answer in RESP2 or RESP3, so the reply parser accepts both
//! (`$-1` and `*-1` decode to [`Frame::Null`] just like `_`). Outgoing
//! commands are always encoded as an array of bulk strings.
//!
//! ```
//! use bytes::BytesMut;
//! use trib_protocol::{encode_command, parse_reply, Frame};
//!
//! let mut buf = BytesMut::new();
//! encode_command(&["CLUSTER", "NODES"], &mut buf);
//! assert_eq!(&buf[..], b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n");
//!
//! let (frame, used) = parse_reply(b"+OK\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//! assert_eq!(used, 5);
//! ```

mod encode;
pub mod error;
pub mod parse;
pub mod types;

pub use encode::encode_command;
pub use error::ProtocolError;
pub use parse::parse_reply;
pub use types::Frame;
