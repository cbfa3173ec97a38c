//! Command encoding.
//!
//! Requests go out as an array of bulk strings, written straight into the
//! connection's buffer. Lengths are formatted with `itoa`.

use bytes::{BufMut, BytesMut};

/// Appends `args` to `dst` as a RESP array of bulk strings.
pub fn encode_command<S: AsRef<str>>(args: &[S], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    put_len(args.len(), dst);
    for arg in args {
        let arg = arg.as_ref().as_bytes();
        dst.put_u8(b'$');
        put_len(arg.len(), dst);
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

fn put_len(len: usize, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(len).as_bytes());
    dst.put_slice(b"\r\n");
}
