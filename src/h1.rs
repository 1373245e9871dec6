//! The built-in HTTP/1.1 pipeline.
//!
//! [`H1Codec`] owns a (possibly TLS wrapped) byte stream and translates
//! it to and from the abstract part streams the dispatcher consumes. One
//! connection carries its exchanges sequentially, reusing the socket
//! between requests when both sides allow it.
//!
//! Trailers ride on chunked transfer encoding in both directions; a
//! streamed response that declares no framing gets
//! `transfer-encoding: chunked` appended to its head. A stream reset
//! (mid-response failure) closes the connection, since HTTP/1.1 has no
//! cleaner way to abandon a response.

use http::{Method, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{
    exchange_queue, BoxIo, CodecParams, ConnectionInfo, Exchange, ExchangeQueue, Exchanges,
    FrameTap, PartFeed, WireCodec,
};
use crate::error::Error;
use crate::http11;
use crate::limit::{allow_reuse, LimitRead, LimitWrite};
use crate::middleware::BoxFuture;
use crate::parts::{OutboundFrame, Protocol, RequestPart, ResponsePart};
use crate::recv_buf::RecvBuf;

/// Size of buffer reading request body into.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// Initial buffer size when writing a response head.
const WRITE_BUF_INIT_SIZE: usize = 8_192;

/// The HTTP/1.1 wire codec.
#[derive(Debug, Default)]
pub struct H1Codec;

impl H1Codec {
    /// Create the codec.
    pub fn new() -> Self {
        H1Codec
    }
}

impl WireCodec for H1Codec {
    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Http1]
    }

    fn serve_connection(
        &self,
        io: BoxIo,
        info: ConnectionInfo,
        params: CodecParams,
    ) -> (BoxFuture<'static, Result<(), Error>>, Exchanges) {
        let (queue, exchanges) = exchange_queue(params.watermarks);

        (Box::pin(drive(io, info, params, queue)), exchanges)
    }
}

/// How one exchange's outbound side ended.
enum Outcome {
    /// The `End` part was written.
    Done { reusable: bool },
    /// The dispatcher reset the stream.
    Reset,
    /// All server handles disappeared without an `End`.
    Dropped,
}

async fn drive(
    io: BoxIo,
    info: ConnectionInfo,
    params: CodecParams,
    queue: ExchangeQueue,
) -> Result<(), Error> {
    let (rd, mut wr) = tokio::io::split(io);
    let mut rb = RecvBuf::with_capacity(READ_BUF_INIT_SIZE, rd);

    let scheme = if info.tls {
        http::uri::Scheme::HTTPS
    } else {
        http::uri::Scheme::HTTP
    };

    let result = loop {
        let head = match http11::read_request_head(&mut rb, scheme.clone()).await {
            Ok(Some(head)) => head,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        let request_reusable = allow_reuse(head.headers(), head.version());
        let is_head_method = head.method() == Method::HEAD;
        let mut limit = LimitRead::from_headers(head.headers());

        let (exchange, peer) = Exchange::pair(params.watermarks, info.request_context());
        let (feed, mut tap) = peer.split();

        if !queue.push(exchange).await {
            // dispatcher is gone, nothing to serve for.
            break Ok(());
        }

        feed.send_part(RequestPart::Head(head)).await;

        let inbound = pump_inbound(&mut rb, &mut limit, feed);
        let outbound = pump_outbound(&mut wr, &mut tap, is_head_method);

        let (in_res, out_res) = tokio::join!(inbound, outbound);

        let outcome = match out_res {
            Ok(v) => v,
            Err(e) => break Err(e),
        };
        if let Err(e) = in_res {
            break Err(e);
        }

        match outcome {
            Outcome::Done { reusable } => {
                if !(request_reusable && reusable) {
                    break Ok(());
                }
                trace!("Connection is reusable");
            }
            Outcome::Reset => {
                trace!("Connection closed by stream reset");
                break Ok(());
            }
            Outcome::Dropped => {
                warn!("Response handles dropped without an end part");
                break Ok(());
            }
        }
    };

    // outbound half-closure, best effort on an already dead socket.
    wr.shutdown().await.ok();

    result
}

/// Feed decoded request body parts to the exchange.
///
/// Keeps draining the wire after the server side stops listening: the
/// request must be consumed in full for the connection to be reusable.
async fn pump_inbound<R: tokio::io::AsyncRead + Unpin>(
    rb: &mut RecvBuf<R>,
    limit: &mut LimitRead,
    feed: PartFeed,
) -> Result<(), Error> {
    let mut receiver_gone = false;

    loop {
        let chunk = match limit.read_chunk(rb, READ_BUF_INIT_SIZE).await {
            Ok(v) => v,
            Err(e) => {
                feed.send_error(Error::User(format!("{}", e)));
                return Err(e);
            }
        };

        match chunk {
            Some(chunk) => {
                if !receiver_gone {
                    receiver_gone = !feed.send_part(RequestPart::Body(chunk)).await;
                    if receiver_gone {
                        trace!("Request reader dropped, draining remaining body");
                    }
                }
            }
            None => {
                let trailers = limit.take_trailers();
                if !receiver_gone {
                    feed.send_part(RequestPart::End(trailers)).await;
                }
                return Ok(());
            }
        }
    }
}

/// Serialize outbound frames onto the wire until the exchange concludes.
async fn pump_outbound<W: AsyncWrite + Unpin>(
    wr: &mut W,
    tap: &mut FrameTap,
    is_head_method: bool,
) -> Result<Outcome, Error> {
    let mut limit: Option<LimitWrite> = None;
    let mut reusable = true;
    let mut out = Vec::with_capacity(WRITE_BUF_INIT_SIZE);

    loop {
        let Some(frame) = tap.next_frame().await else {
            return Ok(Outcome::Dropped);
        };

        out.clear();

        match frame {
            OutboundFrame::Part(ResponsePart::Head(res)) if res.status().is_informational() => {
                // informational heads have no body and no framing.
                http11::write_response_head(&res, false, &mut out)?;
                wr.write_all(&out).await?;
                wr.flush().await?;
            }

            OutboundFrame::Part(ResponsePart::Head(res)) => {
                // invariant: the sender writes at most one final head.
                assert!(limit.is_none(), "Second final head on one exchange");

                let lw = LimitWrite::from_response(&res, is_head_method);
                let force_chunked = lw.needs_chunked_header(&res);

                http11::write_response_head(&res, force_chunked, &mut out)?;
                reusable = allow_reuse(res.headers(), Version::HTTP_11);

                wr.write_all(&out).await?;
                wr.flush().await?;

                limit = Some(lw);
            }

            OutboundFrame::Part(ResponsePart::Body(b)) => {
                // invariant: writers only exist after the final head.
                let lw = limit.as_mut().expect("Body part before response head");

                lw.write(&b, &mut out)?;

                if !out.is_empty() {
                    wr.write_all(&out).await?;
                    wr.flush().await?;
                }
            }

            OutboundFrame::Part(ResponsePart::End(trailers)) => {
                let lw = limit.as_mut().expect("End part before response head");

                if let Some(dropped) = lw.finish(trailers.as_ref(), &mut out) {
                    warn!(
                        "Dropping {} trailer(s): response framing is not chunked",
                        dropped.len()
                    );
                }

                if !out.is_empty() {
                    wr.write_all(&out).await?;
                }
                wr.flush().await?;

                return Ok(Outcome::Done { reusable });
            }

            OutboundFrame::Reset(reason) => {
                debug!("Stream reset: {:?}", reason);
                return Ok(Outcome::Reset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Http2Settings, Watermarks};
    use crate::parts::ResetReason;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn params() -> CodecParams {
        CodecParams {
            watermarks: Watermarks::default(),
            http2: Http2Settings::default(),
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            peer_addr: None,
            local_addr: None,
            protocol: Protocol::Http1,
            tls: false,
            peer_certificates: None,
        }
    }

    /// Run the codec against an in-memory socket, with a trivial
    /// dispatcher stand-in driving each exchange through `f`.
    fn start<F, Fut>(f: F) -> tokio::io::DuplexStream
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let codec = H1Codec::new();
        let (driver, mut exchanges) = codec.serve_connection(Box::new(server), info(), params());

        tokio::spawn(driver);
        tokio::spawn(async move {
            while let Some(exchange) = exchanges.next().await {
                f(exchange).await;
            }
        });

        client
    }

    async fn next_part(exchange: &mut Exchange) -> RequestPart {
        exchange.parts.recv().await.unwrap().unwrap()
    }

    async fn read_until_closed(client: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut all = Vec::new();
        client.read_to_end(&mut all).await.unwrap();
        all
    }

    #[tokio::test]
    async fn get_with_chunked_response_and_trailers() {
        let mut client = start(|mut exchange: Exchange| async move {
            let RequestPart::Head(head) = next_part(&mut exchange).await else {
                panic!("expected head first");
            };
            assert_eq!(head.method(), &Method::GET);
            assert_eq!(head.path(), "/");

            let RequestPart::End(None) = next_part(&mut exchange).await else {
                panic!("expected end after bodiless head");
            };

            let res = http::Response::builder().status(200).body(()).unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Head(res))
                .await
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Body(vec![1, 2]))
                .await
                .unwrap();
            let mut trailers = http::HeaderMap::new();
            trailers.insert("server-timing", "test".parse().unwrap());
            exchange
                .outbound
                .send_part(ResponsePart::End(Some(trailers)))
                .await
                .unwrap();
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until_closed(&mut client).await;
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              2\r\n\x01\x02\r\n0\r\nserver-timing: test\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn chunked_request_with_trailers_reaches_the_exchange() {
        let mut client = start(|mut exchange: Exchange| async move {
            let RequestPart::Head(_) = next_part(&mut exchange).await else {
                panic!("expected head first");
            };

            let mut body = Vec::new();
            let trailers = loop {
                match next_part(&mut exchange).await {
                    RequestPart::Body(b) => body.extend_from_slice(&b),
                    RequestPart::End(t) => break t,
                    RequestPart::Head(_) => panic!("second head"),
                }
            };

            assert_eq!(body, b"OK\n");
            let trailers = trailers.unwrap();
            assert_eq!(trailers.get("trailer").unwrap(), "test_trailer");

            let res = http::Response::builder()
                .status(200)
                .header("content-length", "0")
                .header("connection", "close")
                .body(())
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Head(res))
                .await
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::End(None))
                .await
                .unwrap();
        });

        client
            .write_all(
                b"POST /path HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n\
                  3\r\nOK\n\r\n0\r\ntrailer: test_trailer\r\n\r\n",
            )
            .await
            .unwrap();

        let wire = read_until_closed(&mut client).await;
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn keep_alive_serves_two_requests() {
        let mut client = start(|mut exchange: Exchange| async move {
            let RequestPart::Head(head) = next_part(&mut exchange).await else {
                panic!("expected head first");
            };
            let RequestPart::End(_) = next_part(&mut exchange).await else {
                panic!("expected end");
            };

            let res = http::Response::builder()
                .status(200)
                .header("content-length", "1")
                .body(())
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Head(res))
                .await
                .unwrap();
            let tag = if head.path() == "/first" { b"1" } else { b"2" };
            exchange
                .outbound
                .send_part(ResponsePart::Body(tag.to_vec()))
                .await
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::End(None))
                .await
                .unwrap();
        });

        client
            .write_all(b"GET /first HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0_u8; 39];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n1".as_slice());

        client
            .write_all(b"GET /second HTTP/1.1\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until_closed(&mut client).await;
        assert_eq!(wire, b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n2");
    }

    #[tokio::test]
    async fn reset_closes_the_connection() {
        let mut client = start(|mut exchange: Exchange| async move {
            let RequestPart::Head(_) = next_part(&mut exchange).await else {
                panic!("expected head first");
            };

            exchange.outbound.reset(ResetReason::InternalError);
        });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let wire = read_until_closed(&mut client).await;
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn informational_heads_are_written_before_the_final_head() {
        let mut client = start(|mut exchange: Exchange| async move {
            let RequestPart::Head(_) = next_part(&mut exchange).await else {
                panic!("expected head first");
            };

            let info = http::Response::builder().status(100).body(()).unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Head(info))
                .await
                .unwrap();

            let res = http::Response::builder()
                .status(200)
                .header("content-length", "0")
                .header("connection", "close")
                .body(())
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::Head(res))
                .await
                .unwrap();
            exchange
                .outbound
                .send_part(ResponsePart::End(None))
                .await
                .unwrap();
        });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let wire = read_until_closed(&mut client).await;
        assert_eq!(
            wire,
            b"HTTP/1.1 100 Continue\r\n\r\n\
              HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    }
}
