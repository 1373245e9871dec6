use std::str::FromStr;

use http::header::HeaderMap;
use http::{StatusCode, Version};
use tokio::io::AsyncRead;

use crate::chunked::{self, ChunkedDecoder};
use crate::error::Error;
use crate::recv_buf::RecvBuf;

/// Limit reading request body data given configuration from request headers.
pub(crate) enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    /// Create an instance from request headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked decoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a reader limited by length
    /// 3. Otherwise consider there being no body.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        // https://tools.ietf.org/html/rfc7230#page-31
        // If a message is received with both a Transfer-Encoding and a
        // Content-Length header field, the Transfer-Encoding overrides the
        // Content-Length.
        let ret = if is_chunked(headers) {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new())
        } else if let Some(size) = get_as::<u64>(headers, "content-length") {
            LimitRead::ContentLength(ContentLengthRead::new(size))
        } else {
            LimitRead::NoBody
        };

        trace!("LimitRead from headers: {:?}", ret);

        ret
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    /// Read up to `max` decoded body bytes. `None` at the end of the body.
    pub async fn read_chunk<R: AsyncRead + Unpin>(
        &mut self,
        rb: &mut RecvBuf<R>,
        max: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.read_chunk(rb, max).await,
            LimitRead::ContentLength(v) => v.read_chunk(rb, max).await,
            LimitRead::NoBody => Ok(None),
        }
    }

    /// Trailers observed after the final chunk (chunked requests only).
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.take_trailers(),
            _ => None,
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn new(limit: u64) -> Self {
        ContentLengthRead { limit, total: 0 }
    }

    async fn read_chunk<R: AsyncRead + Unpin>(
        &mut self,
        rb: &mut RecvBuf<R>,
        max: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        let left = (self.limit - self.total).min(usize::MAX as u64) as usize;

        if left == 0 {
            // Nothing more should be read.
            return Ok(None);
        }

        let mut buf = vec![0_u8; left.min(max)];
        let amount = rb.read_into(&mut buf).await?;

        if amount == 0 {
            // https://tools.ietf.org/html/rfc7230#page-32
            // If a valid Content-Length header field is present without
            // Transfer-Encoding, its decimal value defines the expected message
            // body length in octets.  If the sender closes the connection or
            // the recipient times out before the indicated number of octets are
            // received, the recipient MUST consider the message to be
            // incomplete and close the connection.
            let msg = format!(
                "Partial body received {} bytes and expected {}",
                self.total, self.limit
            );
            trace!("{}", msg);
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg).into());
        }

        self.total += amount as u64;
        buf.truncate(amount);

        Ok(Some(buf))
    }
}

/// Limit writing response data by a strategy configured by response headers.
///
/// This is to ensure we don't write more data than "promised" by the
/// response header configuration.
pub(crate) enum LimitWrite {
    /// Write data using a chunked encoder.
    ChunkedEncoder,
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    /// Create an instance from a response about to be written.
    ///
    /// 1. Responses that structurally carry no body (1xx, 204, 304, or any
    ///    response to a HEAD request) use no framing at all.
    /// 2. A `content-length: <number>` header limits the write by length.
    /// 3. An explicit `transfer-encoding` header, or no framing header at
    ///    all, uses the chunked encoder. Streamed bodies default to chunked.
    pub fn from_response(res: &http::Response<()>, is_head_request: bool) -> Self {
        // https://tools.ietf.org/html/rfc7230#page-31
        // any response with a 1xx (Informational), 204 (No Content), or
        // 304 (Not Modified) status code is always terminated by the first
        // empty line after the header fields, and any response to a HEAD
        // request, regardless of the header fields present in the message,
        // and thus cannot contain a message body.
        let status = res.status();
        let structurally_bodiless = is_head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let ret = if structurally_bodiless {
            LimitWrite::NoBody
        } else if is_chunked(res.headers()) {
            LimitWrite::ChunkedEncoder
        } else if let Some(limit) = get_as::<u64>(res.headers(), "content-length") {
            LimitWrite::ContentLength(ContentLengthWrite::new(limit))
        } else {
            LimitWrite::ChunkedEncoder
        };

        trace!("LimitWrite from response: {:?}", ret);

        ret
    }

    /// True when the response declares no framing and the head must get a
    /// `transfer-encoding: chunked` header appended.
    pub fn needs_chunked_header(&self, res: &http::Response<()>) -> bool {
        matches!(self, LimitWrite::ChunkedEncoder) && !is_chunked(res.headers())
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            LimitWrite::ContentLength(w) => w.limit == 0,
            LimitWrite::NoBody => true,
            _ => false,
        }
    }

    /// Write some data using this limiter.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            LimitWrite::ChunkedEncoder => {
                chunked::write_chunk(data, out);
                Ok(())
            }
            LimitWrite::ContentLength(v) => v.write(data, out),
            LimitWrite::NoBody => Ok(()),
        }
    }

    /// Finish up writing, called once after all `write()` calls are done.
    ///
    /// Only chunked framing can carry trailers on the wire; returns the
    /// trailers back to the caller when they could not be sent.
    pub fn finish<'a>(
        &mut self,
        trailers: Option<&'a HeaderMap>,
        out: &mut Vec<u8>,
    ) -> Option<&'a HeaderMap> {
        match self {
            LimitWrite::ChunkedEncoder => {
                chunked::write_finish(trailers, out);
                None
            }
            LimitWrite::ContentLength(_) | LimitWrite::NoBody => trailers,
        }
    }
}

/// Limit write by length.
#[derive(Debug)]
pub(crate) struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl ContentLengthWrite {
    fn new(limit: u64) -> Self {
        ContentLengthWrite { limit, total: 0 }
    }

    fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        self.total += data.len() as u64;

        if self.total > self.limit {
            let m = format!(
                "Body data longer than content-length header: {} > {}",
                self.total, self.limit
            );
            return Err(Error::User(m));
        }

        out.extend_from_slice(data);

        Ok(())
    }
}

impl std::fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder")?,
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitRead::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LimitWrite::ChunkedEncoder => write!(f, "ChunkedEncoder")?,
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitWrite::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

pub(crate) fn allow_reuse(headers: &HeaderMap, version: Version) -> bool {
    if version == Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &HeaderMap, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            if h == "keep-alive" {
                Some(true)
            } else if h == "close" {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

fn get_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

fn get_as<T: FromStr>(headers: &HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.parse().ok())
}
