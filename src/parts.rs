//! The abstract part streams exchanged with the wire codec collaborators.
//!
//! A wire codec turns inbound bytes into a sequence of [`RequestPart`]s
//! per request (`Head`, `Body*`, `End`) and turns the server's
//! [`ResponsePart`]s back into bytes. The core never sees raw protocol
//! frames, only parts.

use http::header::HeaderMap;
use http::uri::{Authority, Scheme};
use http::{Method, Version};

/// One element of the inbound part stream of a single request.
#[derive(Debug)]
pub enum RequestPart {
    /// The request head. Always the first part, exactly once.
    Head(RequestHead),
    /// A chunk of request body bytes.
    Body(Vec<u8>),
    /// End of the request, with trailers when the peer sent any.
    End(Option<HeaderMap>),
}

/// One element of the outbound part stream of a single response.
///
/// Legal sequence per request: any number of informational (1xx) heads,
/// then exactly one final head, zero or more bodies, exactly one end.
#[derive(Debug)]
pub enum ResponsePart {
    /// An informational (1xx) or the final response head.
    Head(http::Response<()>),
    /// A chunk of response body bytes.
    Body(Vec<u8>),
    /// End of the response, with trailers when the handler set any.
    End(Option<HeaderMap>),
}

/// What the server hands to a wire codec on the outbound path: response
/// parts interleaved with at most one terminal reset.
#[derive(Debug)]
pub enum OutboundFrame {
    /// An ordinary response part.
    Part(ResponsePart),
    /// Abort the stream. For HTTP/2 this maps to `RST_STREAM`; for
    /// HTTP/1.1 the connection is closed.
    Reset(ResetReason),
}

/// Reset disposition for a stream torn down mid-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The response head was already written; `RST_STREAM(NO_ERROR)`.
    NoError,
    /// Nothing was written yet; `RST_STREAM(INTERNAL_ERROR)`.
    InternalError,
}

/// The wire protocol selected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 (also plain HTTP/1.0 on plaintext listeners).
    Http1,
    /// HTTP/2.
    H2,
}

impl Protocol {
    /// The ALPN protocol id offered/selected for this protocol.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            Protocol::Http1 => b"http/1.1",
            Protocol::H2 => b"h2",
        }
    }

    /// Map a negotiated ALPN id back to a protocol.
    pub fn from_alpn(id: &[u8]) -> Option<Protocol> {
        match id {
            b"http/1.1" => Some(Protocol::Http1),
            b"h2" => Some(Protocol::H2),
            _ => None,
        }
    }
}

/// The head of an incoming request: method, scheme, authority, path and
/// header fields.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    scheme: Option<Scheme>,
    authority: Option<Authority>,
    path: String,
    version: Version,
    headers: HeaderMap,
}

impl RequestHead {
    /// Assemble a head. Used by wire codecs and tests.
    pub fn new(
        method: Method,
        scheme: Option<Scheme>,
        authority: Option<Authority>,
        path: impl Into<String>,
        version: Version,
        headers: HeaderMap,
    ) -> Self {
        RequestHead {
            method,
            scheme,
            authority,
            path: path.into(),
            version,
            headers,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request scheme, when the transport or an absolute-form target
    /// provided one.
    pub fn scheme(&self) -> Option<&Scheme> {
        self.scheme.as_ref()
    }

    /// The request authority (`:authority` or the `host` header).
    pub fn authority(&self) -> Option<&Authority> {
        self.authority.as_ref()
    }

    /// Path and query exactly as requested.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Protocol version the head arrived with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request header fields.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}
