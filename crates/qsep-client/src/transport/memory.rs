//! In-memory stream for testing.
//!
//! The QSEP exchange is strictly request/response, so a whole conversation
//! can be scripted up front: the server's replies are preloaded as input and
//! everything the client writes is captured for inspection.

use std::io::{self, Cursor, Read, Write};

use bytes::{BufMut, BytesMut};

use super::string_to_latin1;

/// A duplex stream backed by memory.
#[derive(Debug, Default)]
pub struct MemoryStream {
    /// Scripted server replies.
    input: Cursor<Vec<u8>>,
    /// Everything written by the client.
    output: Vec<u8>,
    /// Upper bound on bytes returned per `read` call.
    chunk_size: Option<usize>,
    /// Whether the peer has hung up.
    closed: bool,
}

impl MemoryStream {
    /// Creates a stream that will replay `input`.
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: Cursor::new(input.into()),
            ..Default::default()
        }
    }

    /// Limits every `read` call to at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Simulates the peer closing the connection.
    ///
    /// Reads return end-of-stream and writes fail with `BrokenPipe`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Returns the written bytes as little-endian integers.
    pub fn written_ints(&self) -> Vec<i32> {
        self.output
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Returns the number of scripted bytes not yet read.
    pub fn remaining(&self) -> usize {
        let len = self.input.get_ref().len() as u64;
        (len - self.input.position().min(len)) as usize
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let limit = match self.chunk_size {
            Some(chunk) => buf.len().min(chunk),
            None => buf.len(),
        };
        self.input.read(&mut buf[..limit])
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds server replies in wire format.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    buf: BytesMut,
}

impl ResponseBuilder {
    /// Creates an empty reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a little-endian integer.
    pub fn int(mut self, value: i32) -> Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Appends several integers.
    pub fn ints(mut self, values: &[i32]) -> Self {
        for &value in values {
            self.buf.put_i32_le(value);
        }
        self
    }

    /// Appends a length-prefixed Latin-1 string.
    pub fn string(mut self, text: &str) -> Self {
        let bytes = string_to_latin1(text);
        self.buf.put_i32_le(bytes.len() as i32);
        self.buf.put_slice(&bytes);
        self
    }

    /// Appends raw bytes, such as an encoded row.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Appends the greeting and a successful `TransactionCreate` reply.
    pub fn handshake(self, database: &str, version: &str, transaction: i32) -> Self {
        self.string(database).string(version).int(0).int(transaction)
    }

    /// Returns the number of bytes built so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the reply.
    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
