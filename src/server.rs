//! The listener and per-connection dispatcher.
//!
//! For every accepted stream (an HTTP/1.1 connection, or one HTTP/2
//! sub-stream) the dispatcher takes the request head off the part
//! stream, builds the per-request handles, invokes the handler, and
//! reconciles reader/writer state afterwards. All work runs in task
//! groups: one per listener holding one task per connection, each
//! connection holding its driver and one task per exchange, so shutting
//! the listener down cancels everything leaves-first.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::body::{RequestBodyReader, RequestConcludingReader};
use crate::codec::{CodecParams, Exchange, WireCodec};
use crate::config::HttpServerConfig;
use crate::context::RequestContext;
use crate::error::{Error, HandlerError};
use crate::h1::H1Codec;
use crate::middleware::{handler_fn, ArcHandler};
use crate::parts::{RequestHead, RequestPart, ResetReason};
use crate::respond::ResponseSender;
use crate::streaming::Concluding;
use crate::tls::{PeerVerifier, Transport, TransportBuild};

/// Everything one handler invocation owns: the request head, the
/// per-request context, and the two single-shot streaming handles.
///
/// The scope moves into the handler; nothing of the exchange outlives
/// the invocation except what the dispatcher reconciles afterwards.
pub struct RequestScope {
    /// Method, scheme, authority, path and headers.
    pub head: RequestHead,
    /// Immutable per-request metadata (peer chain, connection info).
    pub context: RequestContext,
    /// Single-shot body reader; yields the trailers on conclusion.
    pub body: RequestConcludingReader,
    /// Single-shot capability to respond.
    pub responder: ResponseSender,
}

/// Configures and binds a [`Server`].
pub struct ServerBuilder {
    config: HttpServerConfig,
    codecs: Vec<Arc<dyn WireCodec>>,
    verifier: Option<Arc<dyn PeerVerifier>>,
}

impl ServerBuilder {
    /// Start from a configuration, with the built-in HTTP/1.1 pipeline
    /// registered.
    pub fn new(config: HttpServerConfig) -> Self {
        ServerBuilder {
            config,
            codecs: vec![Arc::new(H1Codec::new())],
            verifier: None,
        }
    }

    /// Register an additional wire codec (an HTTP/2 multiplexer, or a
    /// replacement HTTP/1.1 pipeline). The ALPN offer list follows the
    /// registered codecs.
    pub fn codec(mut self, codec: impl WireCodec) -> Self {
        self.codecs.push(Arc::new(codec));
        self
    }

    /// Install a custom peer verification callback. Only legal together
    /// with one of the mTLS security modes.
    pub fn peer_verifier(mut self, verifier: impl PeerVerifier) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Validate the configuration, build the transport and bind the
    /// listening socket.
    pub async fn bind(self) -> Result<Server, Error> {
        let config = self.config.normalize()?;

        // offer h2 before http/1.1, and only what a codec can speak.
        let mut alpn = Vec::new();
        for proto in [crate::parts::Protocol::H2, crate::parts::Protocol::Http1] {
            if self.codecs.iter().any(|c| c.protocols().contains(&proto)) {
                alpn.push(proto.alpn_id().to_vec());
            }
        }

        let TransportBuild { transport, reload } =
            Transport::build(&config.transport_security, self.verifier, alpn)?;

        let listener =
            TcpListener::bind((config.bind_target.host.as_str(), config.bind_target.port))
                .await?;
        let local_addr = listener.local_addr()?;

        info!("Listening on {}", local_addr);

        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            listener: Mutex::new(Some(listener)),
            local_addr: Mutex::new(Some(local_addr)),
            shutdown,
            transport: Arc::new(transport),
            reload: Mutex::new(reload),
            codecs: Arc::new(self.codecs),
            params: CodecParams {
                watermarks: config.backpressure,
                http2: config.http2,
            },
        })
    }
}

/// A bound HTTP server.
pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    transport: Arc<Transport>,
    reload: Mutex<Option<crate::middleware::BoxFuture<'static, ()>>>,
    codecs: Arc<Vec<Arc<dyn WireCodec>>>,
    params: CodecParams,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &*self.local_addr.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind with the default codec registry (HTTP/1.1 only).
    pub async fn bind(config: HttpServerConfig) -> Result<Server, Error> {
        ServerBuilder::new(config).bind().await
    }

    /// Configure codecs or a peer verifier before binding.
    pub fn builder(config: HttpServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// The bound socket address. Yields [`Error::Closed`] once the
    /// server has shut down.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.local_addr.lock().unwrap().ok_or(Error::Closed)
    }

    /// Serve with an async closure as the handler.
    pub async fn serve<F, Fut>(&self, f: F) -> Result<(), Error>
    where
        F: Fn(RequestScope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.serve_handler(Arc::new(handler_fn(f))).await
    }

    /// Serve with a prebuilt handler (typically the result of a
    /// middleware [`ChainBuilder`](crate::middleware::ChainBuilder)).
    ///
    /// Runs until [`Server::shutdown`] is called or the listener fails.
    /// Handler errors terminate their own stream only and are logged;
    /// listener errors cancel all in-flight work and surface here.
    pub async fn serve_handler(&self, handler: ArcHandler<RequestScope>) -> Result<(), Error> {
        let listener = self.listener.lock().unwrap().take().ok_or(Error::Closed)?;
        let mut shutdown = self.shutdown.subscribe();

        let mut tasks: JoinSet<()> = JoinSet::new();

        if let Some(reload) = self.reload.lock().unwrap().take() {
            tasks.spawn(reload);
        }

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    trace!("Shutdown signalled");
                    break Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            trace!("Accepted connection from {}", peer);

                            tasks.spawn(connection_task(
                                tcp,
                                self.transport.clone(),
                                self.codecs.clone(),
                                self.params,
                                handler.clone(),
                            ));
                        }
                        Err(e) => {
                            // listener level failure takes the server down.
                            break Err(e.into());
                        }
                    }
                }

                // reap finished connection tasks as we go.
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Connection task panicked");
                        }
                    }
                }
            }
        };

        // cancel in-flight connections, leaves first.
        tasks.shutdown().await;

        *self.local_addr.lock().unwrap() = None;

        result
    }

    /// Signal the serve loop to stop. In-flight requests are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// One accepted connection: transport establishment, codec selection,
/// then one task per exchange under this connection's task group.
async fn connection_task(
    tcp: TcpStream,
    transport: Arc<Transport>,
    codecs: Arc<Vec<Arc<dyn WireCodec>>>,
    params: CodecParams,
    handler: ArcHandler<RequestScope>,
) {
    let (io, info) = match transport.establish(tcp).await {
        Ok(v) => v,
        Err(e) => {
            debug!("Transport establish failed: {}", e);
            return;
        }
    };

    let codec = codecs
        .iter()
        .find(|c| c.protocols().contains(&info.protocol));

    let Some(codec) = codec else {
        // only reachable when the ALPN offer and the codec registry
        // disagree, which is a bug in the builder.
        warn!("No codec registered for {:?}", info.protocol);
        return;
    };

    let (driver, mut exchanges) = codec.serve_connection(io, info, params);

    let mut children: JoinSet<()> = JoinSet::new();

    children.spawn(async move {
        if let Err(e) = driver.await {
            debug!("Connection driver failed: {}", e);
        }
    });

    while let Some(exchange) = exchanges.next().await {
        let handler = handler.clone();
        children.spawn(async move {
            // errors already logged and reconciled inside.
            let _ = handle_exchange(handler, exchange).await;
        });
    }

    while children.join_next().await.is_some() {}
}

/// Dispatch one exchange through the handler, then reconcile.
pub(crate) async fn handle_exchange(
    handler: ArcHandler<RequestScope>,
    exchange: Exchange,
) -> Result<(), HandlerError> {
    let Exchange {
        mut parts,
        outbound,
        shared,
        context,
    } = exchange;

    // the first part of a request stream must be its head.
    let head = match parts.recv().await {
        Some(Ok(RequestPart::Head(head))) => head,
        _ => {
            debug!("Exchange did not start with a head part");
            outbound.reset(ResetReason::InternalError);
            return Err("exchange stream did not start with a request head".into());
        }
    };

    let reader = RequestBodyReader::new(parts, shared.clone());

    let scope = RequestScope {
        head,
        context,
        body: Concluding::new(reader),
        responder: ResponseSender::new(outbound.clone(), shared.clone()),
    };

    match handler.handle(scope).await {
        Ok(()) => {
            if !shared.finished_writing() {
                warn!("Handler returned without concluding a response");
                outbound.reset(reset_reason(&shared));
                return Err("handler returned without concluding a response".into());
            }
            // an unread request body is drained or reset by the codec
            // once the reader handle is gone.
            Ok(())
        }
        Err(e) => {
            warn!("Handler failed: {}", e);

            if !shared.finished_writing() {
                outbound.reset(reset_reason(&shared));
            } else if !shared.finished_reading() {
                // response is complete but the request was not consumed.
                outbound.reset(ResetReason::NoError);
            }

            Err(e)
        }
    }
}

fn reset_reason(shared: &crate::respond::ExchangeShared) -> ResetReason {
    if shared.head_sent() {
        ResetReason::NoError
    } else {
        ResetReason::InternalError
    }
}
