//! Protocol-independent streaming primitives.
//!
//! [`AsyncReader`] and [`AsyncWriter`] are the minimal element-stream
//! abstractions the HTTP handles are built on: read one chunk through a
//! borrowed view with an optional element limit, write one chunk. They are
//! deliberately pre-HTTP and can be instantiated for other protocols.
//!
//! [`Concluding`] and [`ConcludingWriter`] turn a reader/writer into a
//! single-shot streaming session that ends with a typed final element
//! (for HTTP: the trailers). The interaction is callback-scoped on
//! purpose: the final element is surfaced/written inside the same scope
//! that runs the body callback, so wrappers installed around that scope
//! (spans, timeouts) observe the terminal element too. Returning the
//! final element as a separate future would break exactly that.

use std::fmt;
use std::future::Future;

/// Failure of a [`AsyncReader::read`] call: either the underlying source
/// failed, or the caller's own body callback did. Keeping the two apart
/// lets callers recognize their own errors when they bubble back out.
#[derive(Debug)]
pub enum ReadError<S, B> {
    /// The underlying element source failed.
    Source(S),
    /// The body callback returned an error.
    Body(B),
}

impl<S: fmt::Display, B: fmt::Display> fmt::Display for ReadError<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadError::Source(e) => write!(f, "read source: {}", e),
            ReadError::Body(e) => write!(f, "read body: {}", e),
        }
    }
}

impl<S, B> std::error::Error for ReadError<S, B>
where
    S: fmt::Display + fmt::Debug,
    B: fmt::Display + fmt::Debug,
{
}

/// Failure of a concluding write session: either the sink failed, or the
/// caller's body callback did.
#[derive(Debug)]
pub enum WriteError<S, B> {
    /// The underlying sink failed.
    Sink(S),
    /// The body callback returned an error.
    Body(B),
}

impl<S: fmt::Display, B: fmt::Display> fmt::Display for WriteError<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WriteError::Sink(e) => write!(f, "write sink: {}", e),
            WriteError::Body(e) => write!(f, "write body: {}", e),
        }
    }
}

impl<S, B> std::error::Error for WriteError<S, B>
where
    S: fmt::Display + fmt::Debug,
    B: fmt::Display + fmt::Debug,
{
}

/// Read one chunk at a time through a borrowed view.
///
/// `read` hands the body callback a view of at most `max` elements (all
/// available elements when `max` is `None`). A zero length view signals
/// end-of-stream. When the producer offers more than `max`, the reader
/// stashes the excess for the next call; there is no other internal
/// buffering.
pub trait AsyncReader {
    /// Element type of the stream (bytes for HTTP bodies).
    type Item;
    /// Error produced by the underlying source.
    type Error;

    /// Read the next chunk, bounded by `max` elements.
    fn read<T, E, F>(
        &mut self,
        max: Option<usize>,
        body: F,
    ) -> impl Future<Output = Result<T, ReadError<Self::Error, E>>> + Send
    where
        F: FnOnce(&[Self::Item]) -> Result<T, E> + Send,
        T: Send,
        E: Send;

    /// Accumulate chunks until end-of-stream, then run `body` over the
    /// collected elements. When the stream holds more than `up_to`
    /// elements only the first `up_to` are kept; the remainder is still
    /// drained (so stream-terminal state, such as trailers, is reached)
    /// but discarded.
    fn collect<T, E, F>(
        &mut self,
        up_to: usize,
        body: F,
    ) -> impl Future<Output = Result<T, ReadError<Self::Error, E>>> + Send
    where
        Self: Send,
        Self::Item: Clone + Send,
        Self::Error: Send,
        F: FnOnce(&[Self::Item]) -> Result<T, E> + Send,
        T: Send,
        E: Send,
    {
        async move {
            let mut all: Vec<Self::Item> = Vec::new();

            loop {
                let chunk = self
                    .read(None, |view: &[Self::Item]| Ok::<_, E>(view.to_vec()))
                    .await?;

                if chunk.is_empty() {
                    break;
                }

                if all.len() < up_to {
                    let take = chunk.len().min(up_to - all.len());
                    all.extend_from_slice(&chunk[..take]);
                }
            }

            body(&all).map_err(ReadError::Body)
        }
    }
}

/// Append one chunk at a time to a sink.
pub trait AsyncWriter {
    /// Chunk type accepted by the sink (byte vectors for HTTP bodies).
    type Chunk;
    /// Error produced by the underlying sink.
    type Error;

    /// Append one chunk.
    fn write(&mut self, chunk: Self::Chunk) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A reader that captures a typed final element when its stream ends.
pub trait Finalize {
    /// The final element type (for HTTP requests: optional trailers).
    type Final;

    /// Take the captured final element. Meaningful only once the stream
    /// has been read to its end; before that the implementation returns
    /// whatever "absent" means for `Final`.
    fn take_final(&mut self) -> Self::Final;
}

/// A writer whose stream is terminated by writing a typed final element.
pub trait FinalWrite: AsyncWriter {
    /// The final element type (for HTTP responses: optional trailers).
    type Final;

    /// Write the terminal element, ending the stream.
    fn write_final(
        &mut self,
        fin: Self::Final,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Single-shot read session ending with a typed final element.
///
/// Consuming is by move: a second consumption does not compile.
pub struct Concluding<R> {
    inner: R,
}

impl<R> Concluding<R>
where
    R: Finalize + Send,
{
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Concluding { inner }
    }

    /// Run `body` with exclusive access to the underlying reader, then
    /// yield the final element captured while reading alongside `body`'s
    /// result.
    ///
    /// An error return from `body` aborts the session; the final element
    /// is not surfaced in that case.
    pub async fn consume_and_conclude<T, E>(
        mut self,
        body: impl AsyncFnOnce(&mut R) -> Result<T, E>,
    ) -> Result<(T, R::Final), E> {
        let out = body(&mut self.inner).await?;
        Ok((out, self.inner.take_final()))
    }

    /// Drop the session without reading. The underlying stream is simply
    /// abandoned; cleanup is the owner's (dispatcher's) concern.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Single-shot write session that writes a typed final element on scope
/// exit.
///
/// Consuming is by move: a second consumption does not compile.
pub struct ConcludingWriter<W> {
    inner: W,
}

impl<W> ConcludingWriter<W>
where
    W: FinalWrite + Send,
{
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        ConcludingWriter { inner }
    }

    /// Run `body` with exclusive access to the underlying writer. On
    /// normal return the final element `body` produced is written as the
    /// stream terminator, on every normal exit path, which is what makes
    /// the terminator impossible to forget and impossible to duplicate.
    ///
    /// When `body` errors the terminator is NOT written; the caller
    /// (dispatcher) sees the failure and tears the stream down.
    pub async fn produce_and_conclude<T, E>(
        mut self,
        body: impl AsyncFnOnce(&mut W) -> Result<(T, W::Final), E>,
    ) -> Result<T, WriteError<W::Error, E>> {
        let (out, fin) = body(&mut self.inner).await.map_err(WriteError::Body)?;

        self.inner.write_final(fin).await.map_err(WriteError::Sink)?;

        Ok(out)
    }

    /// Convenience: write one chunk, then conclude with `fin`.
    pub async fn write_and_conclude(
        mut self,
        chunk: W::Chunk,
        fin: W::Final,
    ) -> Result<(), W::Error>
    where
        W::Chunk: Send,
        W::Final: Send,
    {
        self.inner.write(chunk).await?;
        self.inner.write_final(fin).await?;
        Ok(())
    }
}
