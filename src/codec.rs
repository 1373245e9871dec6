//! The seam between the core and its wire codec collaborators.
//!
//! A wire codec owns a negotiated transport stream and translates it to
//! and from the abstract part streams of [`crate::parts`]. The core never
//! parses or frames protocol bytes itself; it consumes [`Exchange`]s.
//!
//! One [`Exchange`] is one HTTP request/response pair. An HTTP/1.1 codec
//! yields exchanges sequentially; an HTTP/2 codec yields one exchange per
//! concurrent stream. The dispatcher runs one task per exchange, nested
//! inside the connection's task group.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel;
use crate::config::{Http2Settings, Watermarks};
use crate::context::RequestContext;
use crate::error::Error;
use crate::middleware::BoxFuture;
use crate::parts::{OutboundFrame, Protocol, RequestPart};
use crate::respond::{ExchangeShared, PartSink};

/// Transport stream handed to a codec: any async byte stream.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> Io for S where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed transport stream.
pub type BoxIo = Box<dyn Io>;

/// What the transport selector learned about a connection before handing
/// it to a codec.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address.
    pub peer_addr: Option<SocketAddr>,
    /// Local (accepted-on) address.
    pub local_addr: Option<SocketAddr>,
    /// Negotiated wire protocol.
    pub protocol: Protocol,
    /// Whether the stream is TLS protected.
    pub tls: bool,
    /// Client certificate chain presented during an mTLS handshake.
    pub peer_certificates: Option<Vec<rustls::pki_types::CertificateDer<'static>>>,
}

impl ConnectionInfo {
    /// Per-request context derived from this connection.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::new(
            self.peer_addr,
            self.local_addr,
            self.protocol,
            self.tls,
            self.peer_certificates.clone(),
        )
    }
}

/// Tuning the server passes down to a codec.
#[derive(Debug, Clone, Copy)]
pub struct CodecParams {
    /// Watermarks for the per-exchange part channels.
    pub watermarks: Watermarks,
    /// HTTP/2 tunables; meaningful to HTTP/2 codecs only.
    pub http2: Http2Settings,
}

/// A wire codec collaborator.
pub trait WireCodec: Send + Sync + 'static {
    /// The protocols this codec can speak; used to assemble the ALPN
    /// offer list.
    fn protocols(&self) -> &'static [Protocol];

    /// Take ownership of a negotiated connection. Returns the connection
    /// driver (the future doing the actual byte work) and the stream of
    /// exchanges the driver produces.
    ///
    /// The driver runs as a task in the connection's task group; when it
    /// finishes or errors the exchange stream ends.
    fn serve_connection(
        &self,
        io: BoxIo,
        info: ConnectionInfo,
        params: CodecParams,
    ) -> (BoxFuture<'static, Result<(), Error>>, Exchanges);
}

/// One request/response exchange as seen by the dispatcher.
pub struct Exchange {
    pub(crate) parts: channel::Receiver<Result<RequestPart, Error>>,
    pub(crate) outbound: PartSink,
    pub(crate) shared: std::sync::Arc<ExchangeShared>,
    pub(crate) context: RequestContext,
}

/// The codec-side counterpart of an [`Exchange`]: feed request parts in,
/// take outbound frames out.
pub struct ExchangePeer {
    parts: channel::Sender<Result<RequestPart, Error>>,
    outbound: channel::Receiver<OutboundFrame>,
}

impl Exchange {
    /// Create a connected exchange/peer pair.
    ///
    /// This is how codecs mint exchanges, and doubles as an in-memory
    /// loopback for tests and embedders: feed [`RequestPart`]s through the
    /// peer, run a handler against the exchange, observe the emitted
    /// [`OutboundFrame`]s.
    pub fn pair(watermarks: Watermarks, context: RequestContext) -> (Exchange, ExchangePeer) {
        let (tx_parts, rx_parts) = channel::channel(watermarks);
        let (tx_out, rx_out) = channel::channel(watermarks);

        let exchange = Exchange {
            parts: rx_parts,
            outbound: PartSink::new(tx_out),
            shared: ExchangeShared::new(),
            context,
        };

        let peer = ExchangePeer {
            parts: tx_parts,
            outbound: rx_out,
        };

        (exchange, peer)
    }

    /// The context this exchange carries.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

impl ExchangePeer {
    /// Feed one request part, applying backpressure. Returns false when
    /// the server side of the exchange is gone.
    pub async fn send_part(&self, part: RequestPart) -> bool {
        self.parts.send_when_ready(Ok(part)).await
    }

    /// Surface a wire error to the request reader.
    pub fn send_error(&self, e: Error) -> bool {
        self.parts.send(Err(e))
    }

    /// Receive the next outbound frame. `None` once all server handles
    /// are gone.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Split into the two directions so a codec can pump them
    /// concurrently.
    pub fn split(self) -> (PartFeed, FrameTap) {
        (PartFeed { parts: self.parts }, FrameTap { outbound: self.outbound })
    }
}

/// Inbound half of an [`ExchangePeer`].
pub struct PartFeed {
    parts: channel::Sender<Result<RequestPart, Error>>,
}

impl PartFeed {
    /// Feed one request part, applying backpressure. Returns false when
    /// the server side of the exchange is gone.
    pub async fn send_part(&self, part: RequestPart) -> bool {
        self.parts.send_when_ready(Ok(part)).await
    }

    /// Surface a wire error to the request reader.
    pub fn send_error(&self, e: Error) -> bool {
        self.parts.send(Err(e))
    }
}

/// Outbound half of an [`ExchangePeer`].
pub struct FrameTap {
    outbound: channel::Receiver<OutboundFrame>,
}

impl FrameTap {
    /// Receive the next outbound frame. `None` once all server handles
    /// are gone.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }
}

/// The queue of exchanges a connection driver produces.
pub struct Exchanges {
    rx: channel::Receiver<Exchange>,
}

impl Exchanges {
    /// Next exchange, `None` when the connection is done.
    pub async fn next(&mut self) -> Option<Exchange> {
        self.rx.recv().await
    }
}

/// Codec-side sender for the exchange queue.
pub struct ExchangeQueue {
    tx: channel::Sender<Exchange>,
}

impl ExchangeQueue {
    /// Hand an exchange to the dispatcher. Returns false when the
    /// dispatcher is gone.
    pub async fn push(&self, exchange: Exchange) -> bool {
        self.tx.send_when_ready(exchange).await
    }
}

/// Create the exchange queue wiring for one connection.
pub fn exchange_queue(watermarks: Watermarks) -> (ExchangeQueue, Exchanges) {
    let (tx, rx) = channel::channel(watermarks);
    (ExchangeQueue { tx }, Exchanges { rx })
}
