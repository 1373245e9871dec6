//! Request body reading.
//!
//! [`RequestBodyReader`] turns the inbound [`RequestPart`] stream of one
//! request into bounded byte reads and captures the trailers carried by
//! the terminal `End` part. [`RequestConcludingReader`] is the single-shot
//! wrapper handed to handlers; it surfaces those trailers when its scope
//! ends.

use std::sync::Arc;

use http::header::HeaderMap;

use crate::channel;
use crate::error::Error;
use crate::parts::RequestPart;
use crate::respond::ExchangeShared;
use crate::streaming::{AsyncReader, Concluding, Finalize, ReadError};

/// The single-shot request reader handed to the handler. Consumed exactly
/// once, by move.
pub type RequestConcludingReader = Concluding<RequestBodyReader>;

/// Single-owner handle over the remaining part stream of one request.
///
/// Owns the part iterator; created when the request `Head` is taken off
/// the stream, destroyed at the end of the handler's scope whether or not
/// the body was ever inspected.
pub struct RequestBodyReader {
    parts: channel::Receiver<Result<RequestPart, Error>>,
    state: ReadState,
    trailers: Option<HeaderMap>,
    shared: Arc<ExchangeShared>,
}

enum ReadState {
    /// Still reading body parts.
    Reading(Progress),
    /// The `End` part was observed.
    Finished,
}

enum Progress {
    /// No body part observed yet.
    Initial,
    /// The previous read consumed its chunk entirely.
    NoExcess,
    /// The previous read was limited; the rest of the chunk awaits the
    /// next call.
    Excess { buf: Vec<u8>, at: usize },
}

impl RequestBodyReader {
    pub(crate) fn new(
        parts: channel::Receiver<Result<RequestPart, Error>>,
        shared: Arc<ExchangeShared>,
    ) -> Self {
        RequestBodyReader {
            parts,
            state: ReadState::Reading(Progress::Initial),
            trailers: None,
            shared,
        }
    }

    /// True once the terminal `End` part has been observed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, ReadState::Finished)
    }

    /// Pull the next non-empty body chunk off the part stream.
    ///
    /// Returns `None` at the `End` part (after capturing its trailers).
    /// A `Head` mid-stream or the stream closing without `End` are
    /// protocol-impossible in correct wire code and abort.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match self.parts.recv().await {
                Some(Ok(RequestPart::Body(b))) => {
                    // zero length views mean end-of-stream to the caller,
                    // so empty chunks are dropped here.
                    if b.is_empty() {
                        continue;
                    }
                    return Ok(Some(b));
                }
                Some(Ok(RequestPart::End(trailers))) => {
                    self.trailers = trailers;
                    self.state = ReadState::Finished;
                    self.shared.mark_finished_reading();
                    return Ok(None);
                }
                Some(Ok(RequestPart::Head(_))) => {
                    unreachable!("Head part inside a request body stream");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    panic!("request part stream closed without End part");
                }
            }
        }
    }

    fn deliver<T, E>(
        &mut self,
        buf: Vec<u8>,
        at: usize,
        max: Option<usize>,
        body: impl FnOnce(&[u8]) -> Result<T, E>,
    ) -> Result<T, ReadError<Error, E>> {
        let remaining = buf.len() - at;
        let take = max.map(|m| m.min(remaining)).unwrap_or(remaining);

        let out = body(&buf[at..at + take]).map_err(ReadError::Body);

        self.state = if take < remaining {
            ReadState::Reading(Progress::Excess { buf, at: at + take })
        } else {
            ReadState::Reading(Progress::NoExcess)
        };

        out
    }

    /// The trailers captured from the `End` part, available once the body
    /// has been read to its end.
    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

impl AsyncReader for RequestBodyReader {
    type Item = u8;
    type Error = Error;

    async fn read<T, E, F>(
        &mut self,
        max: Option<usize>,
        body: F,
    ) -> Result<T, ReadError<Error, E>>
    where
        F: FnOnce(&[u8]) -> Result<T, E> + Send,
        T: Send,
        E: Send,
    {
        match std::mem::replace(&mut self.state, ReadState::Reading(Progress::NoExcess)) {
            ReadState::Finished => {
                self.state = ReadState::Finished;
                body(&[]).map_err(ReadError::Body)
            }

            ReadState::Reading(Progress::Excess { buf, at }) => self.deliver(buf, at, max, body),

            ReadState::Reading(Progress::Initial) | ReadState::Reading(Progress::NoExcess) => {
                match self.next_chunk().await.map_err(ReadError::Source)? {
                    Some(buf) => self.deliver(buf, 0, max, body),
                    None => body(&[]).map_err(ReadError::Body),
                }
            }
        }
    }
}

impl Finalize for RequestBodyReader {
    type Final = Option<HeaderMap>;

    fn take_final(&mut self) -> Option<HeaderMap> {
        self.take_trailers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Watermarks;
    use std::convert::Infallible;

    fn reader_with(parts: Vec<Result<RequestPart, Error>>) -> RequestBodyReader {
        let (tx, rx) = channel::channel(Watermarks { low: 2, high: 100 });
        for p in parts {
            tx.send(p);
        }
        drop(tx);
        RequestBodyReader::new(rx, ExchangeShared::new())
    }

    fn body(b: &[u8]) -> Result<RequestPart, Error> {
        Ok(RequestPart::Body(b.to_vec()))
    }

    fn end(trailers: Option<HeaderMap>) -> Result<RequestPart, Error> {
        Ok(RequestPart::End(trailers))
    }

    async fn read_vec(r: &mut RequestBodyReader, max: Option<usize>) -> Vec<u8> {
        r.read(max, |v| Ok::<_, Infallible>(v.to_vec()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unlimited_reads_deliver_chunks_in_order() {
        let mut r = reader_with(vec![body(b"ab"), body(b"cd"), end(None)]);

        assert_eq!(read_vec(&mut r, None).await, b"ab");
        assert_eq!(read_vec(&mut r, None).await, b"cd");
        assert_eq!(read_vec(&mut r, None).await, b"");
        assert!(r.is_finished());
    }

    #[tokio::test]
    async fn limited_read_stashes_excess() {
        let mut r = reader_with(vec![body(b"abcde"), end(None)]);

        assert_eq!(read_vec(&mut r, Some(2)).await, b"ab");
        assert_eq!(read_vec(&mut r, Some(2)).await, b"cd");
        assert_eq!(read_vec(&mut r, None).await, b"e");
        assert_eq!(read_vec(&mut r, None).await, b"");
    }

    #[tokio::test]
    async fn reads_after_finished_stay_empty() {
        let mut r = reader_with(vec![end(None)]);

        assert_eq!(read_vec(&mut r, None).await, b"");
        assert_eq!(read_vec(&mut r, Some(5)).await, b"");
        assert_eq!(read_vec(&mut r, None).await, b"");
    }

    #[tokio::test]
    async fn empty_body_chunks_are_skipped() {
        let mut r = reader_with(vec![body(b""), body(b"x"), body(b""), end(None)]);

        assert_eq!(read_vec(&mut r, None).await, b"x");
        assert_eq!(read_vec(&mut r, None).await, b"");
    }

    #[tokio::test]
    async fn trailers_are_captured_from_end_part() {
        let mut trailers = HeaderMap::new();
        trailers.insert("trailer", "test_trailer".parse().unwrap());

        let mut r = reader_with(vec![body(b"ok"), end(Some(trailers))]);

        assert_eq!(read_vec(&mut r, None).await, b"ok");
        assert_eq!(read_vec(&mut r, None).await, b"");

        let t = r.take_trailers().unwrap();
        assert_eq!(t.get("trailer").unwrap(), "test_trailer");
    }

    #[tokio::test]
    async fn source_errors_are_distinguishable() {
        let (tx, rx) = channel::channel(Watermarks { low: 2, high: 100 });
        tx.send(Err(crate::err_closed::<()>().unwrap_err()));
        drop(tx);
        let mut r = RequestBodyReader::new(rx, ExchangeShared::new());

        let err = r
            .read(None, |v| Ok::<_, Infallible>(v.to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReadError::Source(Error::Io(_))));
    }

    #[tokio::test]
    #[should_panic(expected = "closed without End")]
    async fn stream_closing_without_end_is_fatal() {
        let mut r = reader_with(vec![body(b"partial")]);

        assert_eq!(read_vec(&mut r, None).await, b"partial");
        let _ = read_vec(&mut r, None).await;
    }

    #[tokio::test]
    #[should_panic(expected = "Head part inside a request body stream")]
    async fn head_mid_body_is_fatal() {
        use crate::parts::RequestHead;
        use http::{Method, Version};

        let head = RequestHead::new(
            Method::GET,
            None,
            None,
            "/",
            Version::HTTP_11,
            HeaderMap::new(),
        );
        let mut r = reader_with(vec![Ok(RequestPart::Head(head)), end(None)]);

        let _ = read_vec(&mut r, None).await;
    }

    #[tokio::test]
    async fn collect_truncates_and_still_reaches_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("trailer", "t".parse().unwrap());

        let mut r = reader_with(vec![body(&[5u8; 10]), end(Some(trailers))]);

        let got = r
            .collect(9, |all| Ok::<_, Infallible>(all.to_vec()))
            .await
            .unwrap();

        assert_eq!(got, vec![5u8; 9]);
        assert!(r.is_finished());
        assert!(r.take_trailers().is_some());
    }

    #[tokio::test]
    async fn conclude_returns_body_result_and_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("trailer", "test_trailer".parse().unwrap());

        let r = reader_with(vec![body(b"abc"), end(Some(trailers))]);

        let (all, t) = Concluding::new(r)
            .consume_and_conclude(async |r| {
                r.collect(1024, |all| Ok::<_, Error>(all.to_vec()))
                    .await
                    .map_err(|e| format!("{}", e))
            })
            .await
            .unwrap();

        assert_eq!(all, b"abc");
        assert_eq!(t.unwrap().get("trailer").unwrap(), "test_trailer");
    }
}
