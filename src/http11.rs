//! HTTP/1.1 head parsing and serialization for the built-in HTTP/1.1
//! pipeline.

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

use std::io;
use std::io::Write;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, Scheme};
use http::{Method, Version};
use tokio::io::AsyncRead;

use crate::error::Error;
use crate::parts::RequestHead;
use crate::recv_buf::RecvBuf;

/// Maximum accepted size of a request head.
const MAX_REQUEST_HEAD: usize = 32_768;

/// Maximum number of headers in a request head or trailer block.
pub(crate) const MAX_HEADERS: usize = 128;

/// Read one request head off the connection.
///
/// Returns `None` on a clean connection close between requests. Bytes
/// after the head remain buffered for the body reader.
pub(crate) async fn read_request_head<R: AsyncRead + Unpin>(
    rb: &mut RecvBuf<R>,
    scheme: Scheme,
) -> Result<Option<RequestHead>, Error> {
    loop {
        if let Some(end) = find_crlfcrlf(rb.data()) {
            let head = parse_request_head(&rb.data()[..end], scheme)?;
            rb.consume(end);
            return Ok(Some(head));
        }

        if rb.data().len() > MAX_REQUEST_HEAD {
            return Err(Error::User("Request head too big".into()));
        }

        if rb.fill().await? == 0 {
            if rb.data().is_empty() {
                trace!("Connection closed between requests");
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF inside request head",
            )
            .into());
        }
    }
}

/// Position one past the `\r\n\r\n` terminating a head, if present.
pub(crate) fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_request_head(buf: &[u8], fallback_scheme: Scheme) -> Result<RequestHead, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser.parse(buf)?;

    // invariant: the caller found \r\n\r\n, the head must be complete.
    let size = match status {
        httparse::Status::Complete(v) => v,
        httparse::Status::Partial => unreachable!("Partial request head after CRLFCRLF"),
    };
    assert_eq!(size, buf.len());

    let method: Method = parser
        .method
        .unwrap_or("GET")
        .parse()
        .map_err(|_| Error::User("Invalid method".into()))?;

    let version = match parser.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(parser.headers.len());
    for h in parser.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::User(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::User(format!("Invalid header value: {}", e)))?;
        map.append(name, value);
    }

    let target = parser.path.unwrap_or("/");

    // absolute-form targets carry their own scheme and authority.
    let (scheme, authority, path) = if target.starts_with("http://") || target.starts_with("https://")
    {
        let uri: http::Uri = target
            .parse()
            .map_err(|_| Error::User("Invalid absolute request target".into()))?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        (uri.scheme().cloned(), uri.authority().cloned(), path)
    } else {
        let authority = map
            .get("host")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok());
        (Some(fallback_scheme), authority, target.to_string())
    };

    Ok(RequestHead::new(
        method,
        scheme,
        authority,
        path,
        version,
        map,
    ))
}

/// Write an http/1.x response head (final or informational) to a buffer.
///
/// `force_chunked` appends a `transfer-encoding: chunked` header, used
/// when the response streams a body without declaring its framing.
#[allow(clippy::write_with_newline)]
pub(crate) fn write_response_head(
    res: &http::Response<()>,
    force_chunked: bool,
    buf: &mut Vec<u8>,
) -> Result<(), Error> {
    let ver = match res.version() {
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        _ => "1.1",
    };

    write!(
        buf,
        "HTTP/{} {} {}\r\n",
        ver,
        res.status().as_u16(),
        res.status().canonical_reason().unwrap_or("Unknown")
    )
    .map_err(Error::Io)?;

    for (name, value) in res.headers() {
        write!(buf, "{}: ", name).map_err(Error::Io)?;
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if force_chunked {
        buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }

    buf.extend_from_slice(b"\r\n");

    debug!(
        "write_response_head: {:?}",
        String::from_utf8_lossy(buf)
    );

    Ok(())
}

/// Parse a trailer block (everything between the last chunk and the
/// final empty line, both CRLF terminated).
pub(crate) fn parse_trailers(block: &[u8]) -> Result<HeaderMap, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

    let (_, parsed) = match httparse::parse_headers(block, &mut headers)? {
        httparse::Status::Complete(v) => v,
        httparse::Status::Partial => unreachable!("Partial trailer block after CRLFCRLF"),
    };

    let mut map = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::User(format!("Invalid trailer name: {}", e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::User(format!("Invalid trailer value: {}", e)))?;
        map.append(name, value);
    }

    Ok(map)
}
