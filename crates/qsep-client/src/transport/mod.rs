//! Blocking wire codec.
//!
//! Fixed-width little-endian integers and length-prefixed byte strings over
//! any `Read`/`Write` stream. Reads are always exact: a short read loops until
//! the requested count arrives, and end-of-stream surfaces as
//! [`ClientError::ConnectionClosed`].
//!
//! ```text
//! command:  +-----------+-----------+-----+-----------+-----------+
//!           | opcode(4) | param(4)  | ... | param(4)  | FLUSH(4)  |
//!           +-----------+-----------+-----+-----------+-----------+
//! string:   +-----------+------------------+
//!           | len(4)    | bytes(len)       |
//!           +-----------+------------------+
//! ```

pub mod memory;

pub use memory::{MemoryStream, ResponseBuilder};

use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClientError, ClientResult};
use crate::protocol::{Opcode, FLUSH, MAX_STRING_LEN};

/// Reads exactly `buf.len()` bytes.
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> ClientResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ClientError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads a signed 32-bit little-endian integer.
pub fn read_i32_le<R: Read + ?Sized>(reader: &mut R) -> ClientResult<i32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Writes a signed 32-bit little-endian integer.
pub fn write_i32_le<W: Write + ?Sized>(writer: &mut W, value: i32) -> ClientResult<()> {
    write_bytes(writer, &value.to_le_bytes())
}

/// Writes bytes verbatim and flushes the stream.
pub fn write_bytes<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> ClientResult<()> {
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads a length-prefixed byte string.
pub fn read_length_prefixed<R: Read + ?Sized>(reader: &mut R) -> ClientResult<Vec<u8>> {
    let len = read_i32_le(reader)?;
    let len = usize::try_from(len)
        .map_err(|_| ClientError::protocol(None, format!("negative string length {}", len)))?;
    if len > MAX_STRING_LEN {
        return Err(ClientError::protocol(
            None,
            format!("string length {} exceeds limit {}", len, MAX_STRING_LEN),
        ));
    }

    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed string and decodes it as Latin-1.
pub fn read_string<R: Read + ?Sized>(reader: &mut R) -> ClientResult<String> {
    read_length_prefixed(reader).map(|bytes| latin1_to_string(&bytes))
}

/// Decodes bytes as Latin-1. Every byte maps to the code point of the same
/// value, so decoding never fails.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encodes text as Latin-1, replacing characters above U+00FF with `?`.
pub fn string_to_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Encodes a full command: opcode, parameters, then the flush marker.
pub fn encode_command(opcode: Opcode, params: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 * (params.len() + 2));
    buf.put_i32_le(opcode.as_i32());
    for &param in params {
        buf.put_i32_le(param);
    }
    buf.put_i32_le(FLUSH);
    buf.freeze()
}
