//! Wire-level HTTP/1.1 tests against a live listener.

use std::sync::{Arc, Mutex};

use http::header::HeaderMap;
use scoped_http::{AsyncReader, Error, HandlerError, RequestScope, Server};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

fn builder() -> scoped_http::ServerBuilder {
    Server::builder(common::plaintext_config())
}

async fn drain_request(scope: RequestScope) -> Result<(Vec<u8>, Option<HeaderMap>, scoped_http::ResponseSender), HandlerError> {
    let RequestScope {
        body, responder, ..
    } = scope;

    let (bytes, trailers) = body
        .consume_and_conclude(async |r| {
            r.collect(1024 * 1024, |all| Ok::<_, Error>(all.to_vec()))
                .await
                .map_err(|e| -> HandlerError { format!("{}", e).into() })
        })
        .await?;

    Ok((bytes, trailers, responder))
}

#[tokio::test]
async fn get_with_streamed_body_and_trailer() {
    let (server, addr, serving) = common::serve(builder(), |scope: RequestScope| async move {
        assert_eq!(scope.head.method(), "GET");
        assert_eq!(scope.head.path(), "/");

        let (bytes, trailers, responder) = drain_request(scope).await?;
        assert!(bytes.is_empty());
        assert!(trailers.is_none());

        let res = http::Response::builder().status(200).body(()).unwrap();
        let writer = responder.send(res).await?;

        let mut t = HeaderMap::new();
        t.insert("server-timing", "test".parse().unwrap());
        writer
            .write_and_conclude(vec![1, 2], Some(t))
            .await
            .map_err(|e| -> HandlerError { format!("{}", e).into() })?;

        Ok(())
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_header(&mut tcp).await;
    assert_eq!(
        head,
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n"
    );

    let body = common::read_until_closed(&mut tcp).await;
    assert_eq!(body, b"2\r\n\x01\x02\r\n0\r\nserver-timing: test\r\n\r\n");

    server.shutdown();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn post_with_trailers_echoes_body_and_trailers() {
    let (server, addr, serving) = common::serve(builder(), |scope: RequestScope| async move {
        assert_eq!(scope.head.method(), "POST");

        let (bytes, trailers, responder) = drain_request(scope).await?;
        assert_eq!(bytes, vec![5_u8; 100]);

        let trailers = trailers.expect("request trailers");
        assert_eq!(trailers.get("trailer").unwrap(), "test_trailer");

        let res = http::Response::builder().status(200).body(()).unwrap();
        let writer = responder.send(res).await?;
        writer
            .write_and_conclude(bytes, Some(trailers))
            .await
            .map_err(|e| -> HandlerError { format!("{}", e).into() })?;

        Ok(())
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();

    tcp.write_all(
        b"POST / HTTP/1.1\r\nconnection: close\r\ntransfer-encoding: chunked\r\n\r\n",
    )
    .await
    .unwrap();
    tcp.write_all(b"64\r\n").await.unwrap();
    tcp.write_all(&[5_u8; 100]).await.unwrap();
    tcp.write_all(b"\r\n0\r\ntrailer: test_trailer\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_header(&mut tcp).await;
    assert_eq!(
        head,
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n"
    );

    let body = common::read_until_closed(&mut tcp).await;

    let mut expected = Vec::new();
    expected.extend_from_slice(b"64\r\n");
    expected.extend_from_slice(&[5_u8; 100]);
    expected.extend_from_slice(b"\r\n0\r\ntrailer: test_trailer\r\n\r\n");
    assert_eq!(body, expected);

    server.shutdown();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn streamed_request_chunks_arrive_in_order() {
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Default::default();
    let seen_in_handler = seen.clone();

    let (server, addr, serving) = common::serve(builder(), move |scope: RequestScope| {
        let seen = seen_in_handler.clone();
        async move {
            let RequestScope {
                body, responder, ..
            } = scope;

            body.consume_and_conclude(async |r| {
                loop {
                    let done = r
                        .read(None, |v| {
                            Ok::<_, Error>(if v.is_empty() {
                                true
                            } else {
                                seen.lock().unwrap().push(v.to_vec());
                                false
                            })
                        })
                        .await
                        .map_err(|e| -> HandlerError { format!("{}", e).into() })?;
                    if done {
                        break;
                    }
                }
                Ok::<_, HandlerError>(())
            })
            .await?;

            let res = http::Response::builder()
                .status(200)
                .header("content-length", "0")
                .body(())
                .unwrap();
            let writer = responder.send(res).await?;
            writer
                .produce_and_conclude(async |_| Ok::<_, Error>(((), None)))
                .await
                .map_err(|e| -> HandlerError { format!("{}", e).into() })?;

            Ok(())
        }
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();

    tcp.write_all(
        b"POST / HTTP/1.1\r\nconnection: close\r\ntransfer-encoding: chunked\r\n\r\n",
    )
    .await
    .unwrap();

    for i in 0..100_u8 {
        tcp.write_all(format!("1\r\n{}\r\n", i as char).as_bytes())
            .await
            .unwrap();
        // flush chunk by chunk to keep the wire chunks distinct.
        tcp.flush().await.unwrap();
    }
    tcp.write_all(b"0\r\n\r\n").await.unwrap();

    let head = common::read_header(&mut tcp).await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

    server.shutdown();
    serving.await.unwrap().unwrap();

    let seen = seen.lock().unwrap();
    let flat: Vec<u8> = seen.iter().flatten().copied().collect();
    let expected: Vec<u8> = (0..100_u8).map(|i| i as char as u8).collect();
    assert_eq!(flat, expected);
}

#[tokio::test]
async fn collect_up_to_truncates_without_error() {
    let (server, addr, serving) = common::serve(builder(), |scope: RequestScope| async move {
        let RequestScope {
            body, responder, ..
        } = scope;

        let (collected, _) = body
            .consume_and_conclude(async |r| {
                r.collect(9, |all| Ok::<_, Error>(all.to_vec()))
                    .await
                    .map_err(|e| -> HandlerError { format!("{}", e).into() })
            })
            .await?;

        assert_eq!(collected, vec![5_u8; 9]);

        let res = http::Response::builder()
            .status(200)
            .header("content-length", "1")
            .body(())
            .unwrap();
        let writer = responder.send(res).await?;
        writer
            .write_and_conclude(vec![collected.len() as u8], None)
            .await
            .map_err(|e| -> HandlerError { format!("{}", e).into() })?;

        Ok(())
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();

    tcp.write_all(b"POST / HTTP/1.1\r\nconnection: close\r\ncontent-length: 10\r\n\r\n")
        .await
        .unwrap();
    tcp.write_all(&[5_u8; 10]).await.unwrap();

    let head = common::read_header(&mut tcp).await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n");

    let body = common::read_until_closed(&mut tcp).await;
    assert_eq!(body, vec![9]);

    server.shutdown();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn informational_responses_precede_the_final_head() {
    let (server, addr, serving) = common::serve(builder(), |scope: RequestScope| async move {
        let (_, _, mut responder) = drain_request(scope).await?;

        responder
            .send_informational(http::Response::builder().status(100).body(()).unwrap())
            .await?;
        responder
            .send_informational(http::Response::builder().status(103).body(()).unwrap())
            .await?;

        let res = http::Response::builder().status(200).body(()).unwrap();
        let writer = responder.send(res).await?;

        let mut t = HeaderMap::new();
        t.insert("cookie", "cookie".parse().unwrap());
        writer
            .write_and_conclude(vec![1, 2], Some(t))
            .await
            .map_err(|e| -> HandlerError { format!("{}", e).into() })?;

        Ok(())
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();

    let first = common::read_header(&mut tcp).await;
    assert_eq!(first, "HTTP/1.1 100 Continue\r\n\r\n");

    let second = common::read_header(&mut tcp).await;
    assert_eq!(second, "HTTP/1.1 103 Early Hints\r\n\r\n");

    let third = common::read_header(&mut tcp).await;
    assert_eq!(
        third,
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n"
    );

    let body = common::read_until_closed(&mut tcp).await;
    assert_eq!(body, b"2\r\n\x01\x02\r\n0\r\ncookie: cookie\r\n\r\n");

    server.shutdown();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_error_before_send_closes_the_connection() {
    let (server, addr, serving) = common::serve(builder(), |_scope: RequestScope| async move {
        Err::<(), HandlerError>("deliberate".into())
    })
    .await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    // no response head; the stream is torn down.
    let wire = common::read_until_closed(&mut tcp).await;
    assert!(wire.is_empty());

    server.shutdown();
    serving.await.unwrap().unwrap();
}
