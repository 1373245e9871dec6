//! Middleware composition.
//!
//! A stage receives an input, may transform it (including changing its
//! type, for example by wrapping the streaming handles), and passes
//! ownership on to `next`. Because all streaming handles are single-owner
//! and non-copyable, a stage must either move its input into `next` or
//! consume it fully; there is no way to keep a duplicate ownership path.
//!
//! The terminal stage of every chain is the user handler: a stage that
//! never calls `next` (its next-input type is [`Never`]).
//!
//! Chains are assembled front to back with [`ChainBuilder`], which also
//! supports conditional stages.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::HandlerError;

/// Boxed future used to keep [`Handler`] object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler for inputs of type `In`: the tail of a middleware chain.
pub trait Handler<In>: Send + Sync + 'static {
    /// Handle one input. The input is moved in; any streaming handles it
    /// carries are consumed inside this call.
    fn handle<'a>(&'a self, input: In) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// A shared, type-erased handler.
pub type ArcHandler<In> = Arc<dyn Handler<In>>;

/// Uninhabited next-input type of a terminal stage.
#[derive(Debug, Clone, Copy)]
pub enum Never {}

/// Adapter making a plain async closure usable as a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as the terminal [`Handler`] of a chain.
pub fn handler_fn<In, F, Fut>(f: F) -> HandlerFn<F>
where
    In: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

impl<In, F, Fut> Handler<In> for HandlerFn<F>
where
    In: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, input: In) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin((self.f)(input))
    }
}

impl<In> Handler<In> for ArcHandler<In>
where
    In: Send + 'static,
{
    fn handle<'a>(&'a self, input: In) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).handle(input)
    }
}

/// The continuation a middleware stage passes its (possibly transformed)
/// input to.
pub struct Next<'a, In> {
    inner: &'a dyn Handler<In>,
}

impl<'a, In: 'static> Next<'a, In> {
    /// Run the rest of the chain.
    pub async fn run(self, input: In) -> Result<(), HandlerError> {
        self.inner.handle(input).await
    }
}

/// One stage of a middleware chain.
///
/// `Input` and `Next` may differ; a stage that wraps the request reader
/// with, say, per-chunk logging produces a different scope type than it
/// received.
pub trait Middleware<In>: Send + Sync + 'static {
    /// Input type of the remainder of the chain.
    type Next: Send + 'static;

    /// Process `input`, optionally calling `next` with the transformed
    /// input. Not calling `next` short-circuits the chain.
    fn intercept<'a>(
        &'a self,
        input: In,
        next: Next<'a, Self::Next>,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// A middleware stacked on top of the handler for everything after it.
struct Stacked<M, H> {
    middleware: M,
    inner: H,
}

impl<In, M, H> Handler<In> for Stacked<M, H>
where
    In: Send + 'static,
    M: Middleware<In>,
    H: Handler<M::Next>,
{
    fn handle<'a>(&'a self, input: In) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.middleware.intercept(input, Next { inner: &self.inner })
    }
}

/// Declarative, front-to-back chain builder.
///
/// `Root` is the input type of the whole chain; the builder tracks the
/// input type `In` expected by the next stage to be added. Composition is
/// associative: the chain behaves identically however the stages are
/// grouped.
///
/// ```rust,ignore
/// let handler = ChainBuilder::new()
///     .layer(auth)
///     .layer_if(cfg.log_requests, request_log)
///     .terminate(my_handler);
/// ```
pub struct ChainBuilder<Root, In> {
    wrap: Box<dyn FnOnce(ArcHandler<In>) -> ArcHandler<Root> + Send>,
}

impl<Root> ChainBuilder<Root, Root>
where
    Root: Send + 'static,
{
    /// An empty chain: the terminal handler receives `Root` directly.
    pub fn new() -> Self {
        ChainBuilder {
            wrap: Box::new(|h| h),
        }
    }
}

impl<Root> Default for ChainBuilder<Root, Root>
where
    Root: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Root, In> ChainBuilder<Root, In>
where
    Root: Send + 'static,
    In: Send + 'static,
{
    /// Append a stage to the back of the chain.
    pub fn layer<M>(self, middleware: M) -> ChainBuilder<Root, M::Next>
    where
        M: Middleware<In>,
    {
        let wrap = self.wrap;
        ChainBuilder {
            wrap: Box::new(move |inner| {
                wrap(Arc::new(Stacked { middleware, inner }))
            }),
        }
    }

    /// Append a type-preserving stage only when `enabled` is true.
    pub fn layer_if<M>(self, enabled: bool, middleware: M) -> ChainBuilder<Root, In>
    where
        M: Middleware<In, Next = In>,
    {
        if enabled {
            self.layer(middleware)
        } else {
            self
        }
    }

    /// Terminate the chain with the user handler and box the whole thing
    /// up behind the root input type.
    pub fn terminate<H>(self, handler: H) -> ArcHandler<Root>
    where
        H: Handler<In>,
    {
        (self.wrap)(Arc::new(handler))
    }
}
