//! Response writing.
//!
//! [`ResponseSender`] is the single-shot capability to send the final
//! response head; it yields a [`ResponseConcludingWriter`] whose scope
//! exit writes the terminating `End` part. Informational (1xx) responses
//! go through the independent [`ResponseSender::send_informational`]
//! capability, which is lost once the final head is sent.
//!
//! Handle misuse (a body write after the stream concluded, a non-1xx
//! status sent as informational) is a program error and aborts; it is
//! never expected at runtime because the handles are consumed by move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::header::HeaderMap;

use crate::channel;
use crate::err_closed;
use crate::error::Error;
use crate::parts::{OutboundFrame, ResetReason, ResponsePart};
use crate::streaming::{AsyncWriter, ConcludingWriter, FinalWrite};

/// The single-shot concluding writer handed back by
/// [`ResponseSender::send`]. Consumed exactly once, by move.
pub type ResponseConcludingWriter = ConcludingWriter<ResponseBodyWriter>;

/// Response progress of one exchange, shared between the handles owned by
/// the handler and the dispatcher that reconciles state afterwards.
#[derive(Debug)]
pub(crate) struct ExchangeShared {
    finished_reading: AtomicBool,
    write_stage: Mutex<WriteStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteStage {
    NotStarted,
    HeadSent,
    Ending,
    Ended,
}

impl ExchangeShared {
    pub fn new() -> Arc<Self> {
        Arc::new(ExchangeShared {
            finished_reading: AtomicBool::new(false),
            write_stage: Mutex::new(WriteStage::NotStarted),
        })
    }

    pub fn mark_finished_reading(&self) {
        self.finished_reading.store(true, Ordering::Relaxed);
    }

    pub fn finished_reading(&self) -> bool {
        self.finished_reading.load(Ordering::Relaxed)
    }

    pub fn head_sent(&self) -> bool {
        *self.write_stage.lock().unwrap() != WriteStage::NotStarted
    }

    pub fn finished_writing(&self) -> bool {
        *self.write_stage.lock().unwrap() == WriteStage::Ended
    }

    fn advance(&self, from: &[WriteStage], to: WriteStage, what: &str) {
        let mut lock = self.write_stage.lock().unwrap();
        if !from.contains(&*lock) {
            panic!("{} in write stage {:?}", what, *lock);
        }
        *lock = to;
    }
}

/// Outbound sink of one exchange: response parts plus the reset
/// capability. Cloneable so the dispatcher can keep a handle for stream
/// teardown after the writer handles moved into the handler.
pub(crate) struct PartSink {
    tx: channel::Sender<OutboundFrame>,
}

impl Clone for PartSink {
    fn clone(&self) -> Self {
        PartSink { tx: self.tx.clone() }
    }
}

impl PartSink {
    pub(crate) fn new(tx: channel::Sender<OutboundFrame>) -> Self {
        PartSink { tx }
    }

    pub(crate) async fn send_part(&self, part: ResponsePart) -> Result<(), Error> {
        if !self.tx.send_when_ready(OutboundFrame::Part(part)).await {
            return err_closed();
        }
        Ok(())
    }

    /// Abort the stream. Best effort: a connection that is already gone
    /// has nothing left to reset.
    pub(crate) fn reset(&self, reason: ResetReason) {
        self.tx.send(OutboundFrame::Reset(reason));
    }
}

/// Single-shot capability to respond to one request.
///
/// `send_informational` may be used any number of times before `send`;
/// `send` consumes the sender, which is what orders all informational
/// heads before the final head.
pub struct ResponseSender {
    sink: PartSink,
    shared: Arc<ExchangeShared>,
}

impl ResponseSender {
    pub(crate) fn new(sink: PartSink, shared: Arc<ExchangeShared>) -> Self {
        ResponseSender { sink, shared }
    }

    /// Send an informational response. The status MUST be 1xx; anything
    /// else is a program error and aborts.
    pub async fn send_informational(&mut self, response: http::Response<()>) -> Result<(), Error> {
        if !response.status().is_informational() {
            panic!(
                "send_informational with non-informational status {}",
                response.status()
            );
        }

        self.sink.send_part(ResponsePart::Head(response)).await
    }

    /// Send the final response head. The status MUST NOT be 1xx; an
    /// informational status here is a program error and aborts.
    ///
    /// Consumes the sender and yields the concluding body writer. The
    /// caller then concludes the response through
    /// [`ResponseConcludingWriter::produce_and_conclude`] or
    /// [`ResponseConcludingWriter::write_and_conclude`].
    pub async fn send(
        self,
        response: http::Response<()>,
    ) -> Result<ResponseConcludingWriter, Error> {
        if response.status().is_informational() {
            panic!("send with informational status {}", response.status());
        }

        self.shared.advance(
            &[WriteStage::NotStarted],
            WriteStage::HeadSent,
            "final head",
        );

        self.sink.send_part(ResponsePart::Head(response)).await?;

        Ok(ConcludingWriter::new(ResponseBodyWriter {
            sink: self.sink,
            shared: self.shared,
        }))
    }
}

/// Single-owner sink for the response body bytes of one exchange.
///
/// Exists only between the final head and the terminal `End`; both ends
/// of that window are managed by [`ResponseSender::send`] and the
/// concluding wrapper.
pub struct ResponseBodyWriter {
    sink: PartSink,
    shared: Arc<ExchangeShared>,
}

impl AsyncWriter for ResponseBodyWriter {
    type Chunk = Vec<u8>;
    type Error = Error;

    async fn write(&mut self, chunk: Vec<u8>) -> Result<(), Error> {
        {
            let stage = self.shared.write_stage.lock().unwrap();
            if *stage != WriteStage::HeadSent {
                panic!("body write in write stage {:?}", *stage);
            }
        }

        // zero length chunks carry nothing and would terminate chunked
        // framing, so they are dropped here.
        if chunk.is_empty() {
            return Ok(());
        }

        self.sink.send_part(ResponsePart::Body(chunk)).await
    }
}

impl FinalWrite for ResponseBodyWriter {
    type Final = Option<HeaderMap>;

    async fn write_final(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error> {
        self.shared
            .advance(&[WriteStage::HeadSent], WriteStage::Ending, "end");

        self.sink.send_part(ResponsePart::End(trailers)).await?;

        self.shared.advance(&[WriteStage::Ending], WriteStage::Ended, "end");

        Ok(())
    }
}
