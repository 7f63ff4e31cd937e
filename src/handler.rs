//! Handler trait, type erasure and the chain combinator.
//!
//! # Shape of a handler
//!
//! A handler reads a [`Request`] and writes its response into the response
//! channel it is handed:
//!
//! ```text
//! serve(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a>
//! ```
//!
//! `w` is a `&mut BoxWriter` rather than a `&mut dyn ResponseWriter` so that a
//! stage can swap a decorator in around the current writer before recursing
//! into the next handler, and swap it back out afterwards.
//!
//! Every stage in [`crate::middleware`] is itself a `Handler`, so stages nest
//! like ordinary values:
//!
//! ```text
//! PanicHandler::new(LoggingHandler::new(GzipHandler::new(app)))
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::request::Request;
use crate::writer::{self, BoxWriter, ResponseBuffer};

/// A heap-allocated, type-erased future borrowing the request and writer.
///
/// `Send` lets tokio move it across worker threads.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A heap-allocated, type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

// ── Handler trait ─────────────────────────────────────────────────────────────

/// Anything that can answer a request by writing to a response channel.
pub trait Handler: Send + Sync + 'static {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        (**self).serve(req, w)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        (**self).serve(req, w)
    }
}

// ── Closures ──────────────────────────────────────────────────────────────────

/// Turns a closure into a [`Handler`].
///
/// ```rust
/// use strata::{WriterExt, handler_fn};
///
/// let hello = handler_fn(|_req, w| Box::pin(async move {
///     let _ = w.write_str("hello");
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a Request, &'a mut BoxWriter) -> BoxFuture<'a> + Send + Sync + 'static,
{
    HandlerFn(f)
}

/// Handler returned by [`handler_fn`].
pub struct HandlerFn<F>(F);

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a Request, &'a mut BoxWriter) -> BoxFuture<'a> + Send + Sync + 'static,
{
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        (self.0)(req, w)
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// Runs `first` to completion, then `second`, on the same request and writer.
///
/// The two share nothing except what `first` leaves on the writer, so
/// `Chain(Chain(a, b), c)` behaves exactly like `Chain(a, Chain(b, c))`.
pub struct Chain<A, B> {
    first: A,
    second: B,
}

impl<A: Handler, B: Handler> Chain<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: Handler, B: Handler> Handler for Chain<A, B> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            self.first.serve(req, w).await;
            self.second.serve(req, w).await;
        })
    }
}

/// Fluent composition for any handler.
pub trait HandlerExt: Handler + Sized {
    /// `a.chain(b)` is `Chain::new(a, b)`.
    fn chain<B: Handler>(self, next: B) -> Chain<Self, B> {
        Chain::new(self, next)
    }

    /// Erases the concrete type so handlers of different types can be stored
    /// together.
    fn boxed(self) -> BoxedHandler {
        Arc::new(self)
    }
}

impl<H: Handler> HandlerExt for H {}

// ── Running a handler ─────────────────────────────────────────────────────────

/// Runs `handler` against a fresh [`ResponseBuffer`] and returns the finished
/// response.
///
/// Decorators a misbehaving stage forgot to remove are peeled off before the
/// buffer is read back.
pub async fn respond<H: Handler + ?Sized>(handler: &H, req: &Request) -> http::Response<Bytes> {
    let mut w: BoxWriter = Box::new(ResponseBuffer::new());
    handler.serve(req, &mut w).await;
    while writer::peel(&mut w) {}
    writer::lookup_mut::<ResponseBuffer>(w.as_mut())
        .map(std::mem::take)
        .unwrap_or_default()
        .into_response()
}
