//! Low-level HTTP server library where the entire lifetime of a request
//! (head, body chunks, optional trailers, informational responses, final
//! response head, response body, response trailers) is contained inside a
//! single handler invocation.
//!
//! Because the whole exchange happens inside one scope, wrappers installed
//! around the handler (tracing spans, timers, timeouts, cancellation
//! scopes) observe the complete exchange. The terminal parts of both
//! directions are bound to scope exit: request trailers are surfaced when
//! [`RequestConcludingReader::consume_and_conclude`] returns, and the
//! response terminator is written when
//! [`ResponseConcludingWriter::produce_and_conclude`] returns.
//!
//! Streaming handles ([`RequestConcludingReader`], [`ResponseSender`],
//! [`ResponseConcludingWriter`]) are affine: each is consumed by move,
//! exactly once, and the type system forbids a second use.
//!
//! # Example
//!
//! ```rust,no_run
//! use scoped_http::{AsyncReader, HttpServerConfig, RequestScope, Server};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let config: HttpServerConfig = serde_json::from_str(
//!         r#"{ "bindTarget": { "host": "127.0.0.1", "port": 3000 } }"#,
//!     )?;
//!
//!     let server = Server::bind(config).await?;
//!     println!("listening on {}", server.local_addr()?);
//!
//!     server
//!         .serve(|scope: RequestScope| async move {
//!             let RequestScope { head, body, responder, .. } = scope;
//!             println!("{} {}", head.method(), head.path());
//!
//!             // Drain the request, keeping the trailers.
//!             let (_, _trailers) = body
//!                 .consume_and_conclude(async |reader| {
//!                     reader.collect(64 * 1024, |all| Ok::<_, scoped_http::Error>(all.len())).await
//!                 })
//!                 .await?;
//!
//!             let res = http::Response::builder().status(200).body(())?;
//!             let writer = responder.send(res).await?;
//!             writer.write_and_conclude(b"hello".to_vec(), None).await?;
//!             Ok(())
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

mod channel;
mod chunked;
mod http11;
mod limit;
mod recv_buf;

pub mod body;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod h1;
pub mod middleware;
pub mod parts;
pub mod respond;
pub mod server;
pub mod streaming;
pub mod tls;

pub use body::{RequestBodyReader, RequestConcludingReader};
pub use config::{BindTarget, Http2Settings, HttpServerConfig, Watermarks};
pub use context::RequestContext;
pub use error::{ConfigError, Error, HandlerError};
pub use middleware::{handler_fn, ArcHandler, ChainBuilder, Handler, Middleware, Next};
pub use parts::{Protocol, RequestHead, RequestPart, ResetReason, ResponsePart};
pub use respond::{ResponseBodyWriter, ResponseConcludingWriter, ResponseSender};
pub use server::{RequestScope, Server, ServerBuilder};
pub use streaming::{AsyncReader, AsyncWriter, ReadError, WriteError};
pub use tls::{CertificateSource, PeerVerification, PeerVerifier, PemFileSource};

pub(crate) fn err_closed<T>() -> Result<T, Error> {
    use std::io;
    Err(io::Error::new(io::ErrorKind::NotConnected, "Connection is closed").into())
}
