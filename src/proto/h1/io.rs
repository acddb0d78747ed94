use std::cmp;
use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const INIT_BUFFER_SIZE: usize = 8192;

/// The maximum number of bytes a message head may occupy.
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = 8192 + 4096 * 100;

/// An IO with a read buffer, so heads can be parsed and leftover bytes kept
/// for the next message (or for the h2 codec after a protocol switch).
pub(crate) struct Buffered<T> {
    io: T,
    max_buf_size: usize,
    read_buf: BytesMut,
}

impl<T> fmt::Debug for Buffered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffered")
            .field("read_buf", &self.read_buf.len())
            .finish()
    }
}

impl<T> Buffered<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered::with_buffer(io, Bytes::new())
    }

    pub(crate) fn with_buffer(io: T, pre: Bytes) -> Buffered<T> {
        let mut read_buf = BytesMut::with_capacity(cmp::max(INIT_BUFFER_SIZE, pre.len()));
        read_buf.extend_from_slice(&pre);
        Buffered {
            io,
            max_buf_size: DEFAULT_MAX_BUFFER_SIZE,
            read_buf,
        }
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.read_buf.as_ref()
    }

    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub(crate) fn get_ref(&self) -> &T {
        &self.io
    }

    /// Reads more bytes from the IO into the buffer.
    ///
    /// Returns the number of bytes read; zero means EOF.
    pub(crate) async fn read_more(&mut self) -> io::Result<usize> {
        if self.read_buf.len() >= self.max_buf_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "read buffer is full",
            ));
        }
        if self.read_buf.capacity() - self.read_buf.len() < INIT_BUFFER_SIZE {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        let n = self.io.read_buf(&mut self.read_buf).await?;
        trace!("received {} bytes", n);
        Ok(n)
    }

    /// Removes the first `n` buffered bytes.
    pub(crate) fn consume(&mut self, n: usize) -> Bytes {
        self.read_buf.split_to(n).freeze()
    }

    /// Returns up to `len` bytes, reading from the IO if nothing is
    /// buffered. An empty result means EOF.
    pub(crate) async fn read_mem(&mut self, len: usize) -> io::Result<Bytes> {
        if self.read_buf.is_empty() {
            self.read_more().await?;
        }
        let n = cmp::min(len, self.read_buf.len());
        Ok(self.consume(n))
    }

    /// Returns the next CRLF-terminated line, without its terminator.
    pub(crate) async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.read_buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.consume(pos);
                self.read_buf.advance(2);
                return Ok(line);
            }
            if self.read_more().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    pub(crate) fn into_parts(self) -> (T, Bytes) {
        (self.io, self.read_buf.freeze())
    }
}
