//! Per-request scratch space.
//!
//! [`ContextHandler`] hangs an empty [`Context`] off the response channel.
//! Any handler further in can fetch it with [`context`] and stash values for
//! handlers that run after it, typically the second half of a
//! [`Chain`](crate::Chain). The map lives exactly as long as the request and
//! is only ever touched by the task serving it, so it needs no locking.

use std::any::Any;
use std::collections::HashMap;
use std::io;

use http::{HeaderMap, StatusCode};

use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::writer::{self, BoxWriter, ResponseWriter};

/// Request-scoped key/value map. Values are any `Send + Sync` type and are
/// read back by downcasting.
#[derive(Default)]
pub struct Context {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { values: HashMap::with_capacity(capacity) }
    }

    /// Stores `value` under `key`, replacing (and dropping) any previous value.
    pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// `None` when the key is absent or holds a value of another type.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key)?.downcast_ref()
    }

    pub fn get_mut<V: Any>(&mut self, key: &str) -> Option<&mut V> {
        self.values.get_mut(key)?.downcast_mut()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Decorator carrying the [`Context`]. Everything else is forwarded.
pub struct ContextWriter {
    inner: BoxWriter,
    ctx: Context,
}

impl ResponseWriter for ContextWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_head(&mut self, status: StatusCode) {
        self.inner.write_head(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write(buf)
    }

    fn head_written(&self) -> bool {
        self.inner.head_written()
    }

    fn wrapped(&self) -> Option<&dyn ResponseWriter> {
        Some(self.inner.as_ref())
    }

    fn wrapped_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
        Some(self.inner.as_mut())
    }

    fn into_wrapped(self: Box<Self>) -> Result<BoxWriter, BoxWriter> {
        Ok(self.inner)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Stage providing a fresh [`Context`] to the wrapped handler.
///
/// If a context is already present further out, the existing one is reused
/// and this stage does nothing.
pub struct ContextHandler<H> {
    inner: H,
    capacity: usize,
}

impl<H: Handler> ContextHandler<H> {
    /// `capacity` pre-sizes the map.
    pub fn new(inner: H, capacity: usize) -> Self {
        Self { inner, capacity }
    }
}

impl<H: Handler> Handler for ContextHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if writer::lookup::<ContextWriter>(w.as_ref()).is_some() {
                return self.inner.serve(req, w).await;
            }

            let ctx = Context::with_capacity(self.capacity);
            writer::wrap(w, |inner| Box::new(ContextWriter { inner, ctx }));
            self.inner.serve(req, w).await;
            writer::peel(w);
        })
    }
}

/// The context installed by the nearest [`ContextHandler`], or `None` when no
/// context stage wraps this request.
pub fn context(w: &mut dyn ResponseWriter) -> Option<&mut Context> {
    writer::lookup_mut::<ContextWriter>(w).map(|cw| &mut cw.ctx)
}
