//! Immutable per-request metadata.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;

use crate::parts::Protocol;

/// Immutable per-request information captured at request intake and
/// discarded when the handler returns.
///
/// The context is built once per connection by the transport selector and
/// cloned into every exchange the connection carries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    protocol: Protocol,
    tls: bool,
    peer_certificates: Option<Arc<Vec<CertificateDer<'static>>>>,
}

impl RequestContext {
    pub(crate) fn new(
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        protocol: Protocol,
        tls: bool,
        peer_certificates: Option<Vec<CertificateDer<'static>>>,
    ) -> Self {
        RequestContext {
            peer_addr,
            local_addr,
            protocol,
            tls,
            peer_certificates: peer_certificates.map(Arc::new),
        }
    }

    /// A context for exchanges that did not arrive over a socket, such as
    /// in-memory loopback exchanges in tests.
    pub fn synthetic(protocol: Protocol) -> Self {
        RequestContext {
            peer_addr: None,
            local_addr: None,
            protocol,
            tls: false,
            peer_certificates: None,
        }
    }

    /// Remote address of the connection, when it arrived over a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address the connection was accepted on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The negotiated wire protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the connection is TLS protected.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// The verified client certificate chain, present only in the mTLS
    /// modes when the peer presented one.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.peer_certificates.as_deref().map(|v| v.as_slice())
    }
}
