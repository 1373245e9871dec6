//! Chunked transfer-encoding for the built-in HTTP/1.1 pipeline.
//!
//! The decoder is pull based and streams: each call yields at most `max`
//! bytes of decoded data, so a large chunk never has to be buffered
//! whole. Trailers after the final chunk are captured for the request
//! `End` part.

use std::io::Write;

use http::header::HeaderMap;
use tokio::io::AsyncRead;

use crate::error::Error;
use crate::http11::{find_crlfcrlf, parse_trailers};
use crate::recv_buf::RecvBuf;

/// Longest accepted chunk-size line (hex size plus extensions).
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Longest accepted trailer block.
const MAX_TRAILER_BLOCK: usize = 32_768;

#[derive(Debug)]
enum DecoderState {
    /// Expecting a chunk-size line.
    Size,
    /// Inside chunk data.
    Data { remaining: usize },
    /// Expecting the CRLF after chunk data.
    DataEnd,
    /// Final chunk seen; trailers captured.
    Done,
}

#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: DecoderState,
    trailers: Option<HeaderMap>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::Size,
            trailers: None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, DecoderState::Done)
    }

    /// Trailers following the final chunk, when the peer sent any.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// Decode up to `max` bytes of chunk data. `None` once the final
    /// chunk (and its trailer block) has been consumed.
    pub async fn read_chunk<R: AsyncRead + Unpin>(
        &mut self,
        rb: &mut RecvBuf<R>,
        max: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match self.state {
                DecoderState::Size => {
                    let line_end = require_crlf_line(rb, MAX_CHUNK_SIZE_LINE).await?;
                    let size = parse_chunk_size(&rb.data()[..line_end])?;
                    rb.consume(line_end + 2);

                    if size == 0 {
                        self.read_trailer_block(rb).await?;
                        self.state = DecoderState::Done;
                    } else {
                        self.state = DecoderState::Data { remaining: size };
                    }
                }

                DecoderState::Data { remaining } => {
                    if rb.data().is_empty() && rb.fill().await? == 0 {
                        return Err(unexpected_eof("EOF inside chunk data"));
                    }

                    let take = rb.data().len().min(remaining).min(max);
                    let out = rb.data()[..take].to_vec();
                    rb.consume(take);

                    let left = remaining - take;
                    self.state = if left == 0 {
                        DecoderState::DataEnd
                    } else {
                        DecoderState::Data { remaining: left }
                    };

                    return Ok(Some(out));
                }

                DecoderState::DataEnd => {
                    while rb.data().len() < 2 {
                        if rb.fill().await? == 0 {
                            return Err(unexpected_eof("EOF after chunk data"));
                        }
                    }
                    if &rb.data()[..2] != b"\r\n" {
                        return Err(Error::User("Missing CRLF after chunk data".into()));
                    }
                    rb.consume(2);
                    self.state = DecoderState::Size;
                }

                DecoderState::Done => return Ok(None),
            }
        }
    }

    /// Consume everything between the final chunk and the terminating
    /// empty line, capturing any trailers.
    async fn read_trailer_block<R: AsyncRead + Unpin>(
        &mut self,
        rb: &mut RecvBuf<R>,
    ) -> Result<(), Error> {
        loop {
            // an empty line directly after the 0-chunk means no trailers.
            if rb.data().starts_with(b"\r\n") {
                rb.consume(2);
                return Ok(());
            }

            if let Some(end) = find_crlfcrlf(rb.data()) {
                let map = parse_trailers(&rb.data()[..end])?;
                rb.consume(end);
                if !map.is_empty() {
                    self.trailers = Some(map);
                }
                return Ok(());
            }

            if rb.data().len() > MAX_TRAILER_BLOCK {
                return Err(Error::User("Trailer block too big".into()));
            }

            if rb.fill().await? == 0 {
                return Err(unexpected_eof("EOF inside trailer block"));
            }
        }
    }
}

/// Find the end of a CRLF terminated line, filling as needed. Returns
/// the offset of the CR.
async fn require_crlf_line<R: AsyncRead + Unpin>(
    rb: &mut RecvBuf<R>,
    max: usize,
) -> Result<usize, Error> {
    loop {
        if let Some(pos) = rb.data().windows(2).position(|w| w == b"\r\n") {
            return Ok(pos);
        }

        if rb.data().len() > max {
            return Err(Error::User("Chunk size line too long".into()));
        }

        if rb.fill().await? == 0 {
            return Err(unexpected_eof("EOF inside chunk size line"));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, Error> {
    // chunk extensions after a semicolon are ignored.
    let size_part = match line.iter().position(|b| *b == b';') {
        Some(at) => &line[..at],
        None => line,
    };

    let s = std::str::from_utf8(size_part)
        .map_err(|_| Error::User("Chunk size is not utf-8".into()))?;

    usize::from_str_radix(s.trim(), 16)
        .map_err(|_| Error::User(format!("Not a chunk size: {}", s)))
}

fn unexpected_eof(msg: &str) -> Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg.to_string()).into()
}

/// Encode one chunk of body data.
pub(crate) fn write_chunk(data: &[u8], out: &mut Vec<u8>) {
    // zero sized chunks terminate the stream; the caller filters them.
    assert!(!data.is_empty(), "write_chunk with empty data");

    write!(out, "{:x}\r\n", data.len()).expect("write chunk header");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encode the final chunk, with an optional trailer block.
pub(crate) fn write_finish(trailers: Option<&HeaderMap>, out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n");

    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            write!(out, "{}: ", name).expect("write trailer name");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");
}
