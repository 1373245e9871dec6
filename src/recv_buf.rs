use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// How much to grow the buffer per fill from the underlying stream.
const READ_CHUNK: usize = 16_384;

/// Buffered reader over the transport read half.
///
/// Head parsing needs look-ahead over an unknown amount of bytes, body
/// reading wants to drain the look-ahead before touching the socket
/// again; this covers both with a consume pointer over one buffer.
#[derive(Debug)]
pub(crate) struct RecvBuf<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> RecvBuf<R> {
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        RecvBuf {
            inner,
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Unconsumed buffered bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn consume(&mut self, amount: usize) {
        let new_pos = self.pos + amount;

        // can't consume more than we have.
        assert!(new_pos <= self.buf.len());

        if new_pos == self.buf.len() {
            // all was consumed, reset back to start.
            self.pos = 0;
            self.buf.truncate(0);
        } else {
            self.pos = new_pos;
        }
    }

    /// Read more from the underlying stream into the buffer. Returns the
    /// number of new bytes; 0 means the stream reached its end.
    pub async fn fill(&mut self) -> io::Result<usize> {
        // compact before growing when everything buffered is consumed.
        if self.pos > 0 && self.pos == self.buf.len() {
            self.pos = 0;
            self.buf.truncate(0);
        }

        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK, 0);

        let amount = match self.inner.read(&mut self.buf[len..]).await {
            Ok(v) => v,
            Err(e) => {
                self.buf.truncate(len);
                return Err(e);
            }
        };

        self.buf.truncate(len + amount);

        Ok(amount)
    }

    /// Read up to `out.len()` bytes, serving buffered bytes first and
    /// only then going to the underlying stream.
    pub async fn read_into(&mut self, out: &mut [u8]) -> io::Result<usize> {
        assert!(!out.is_empty(), "read_into with len 0 buf");

        let has_amount = self.buf.len() - self.pos;

        if has_amount > 0 {
            let max = out.len().min(has_amount);
            out[0..max].copy_from_slice(&self.buf[self.pos..self.pos + max]);

            self.consume(max);

            return Ok(max);
        }

        self.inner.read(out).await
    }
}
