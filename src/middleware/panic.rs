//! Panic recovery.
//!
//! [`PanicHandler`] catches a panic raised while the wrapped handler runs and
//! turns it into a `500 Internal Server Error` whose plain-text body is the
//! panic message. With an error handler configured, that handler answers
//! instead and can inspect the panic value through [`panic_payload`].
//!
//! Put this stage outermost. Only panics raised inside it are caught, and
//! that includes the cleanup other stages run after their wrapped handler.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::{error, warn};

use crate::handler::{BoxFuture, BoxedHandler, Handler, HandlerExt};
use crate::request::Request;
use crate::writer::{self, BoxWriter, ResponseWriter};

/// The value a handler panicked with. It can be anything, not only a string.
pub struct PanicPayload(Box<dyn Any + Send>);

impl PanicPayload {
    /// The panic message for `&str` / `String` payloads, a fixed description
    /// otherwise.
    pub fn message(&self) -> String {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked with a non-string payload".to_owned()
        }
    }

    /// The payload, if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.0
    }
}

/// Decorator exposing the caught [`PanicPayload`] to the error handler.
pub struct PanicWriter {
    inner: BoxWriter,
    payload: PanicPayload,
}

impl ResponseWriter for PanicWriter {
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

/// Stage converting panics of the wrapped handler into error responses.
pub struct PanicHandler<H> {
    inner: H,
    on_panic: Option<BoxedHandler>,
}

impl<H: Handler> PanicHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner, on_panic: None }
    }

    /// Answers panics with `handler` instead of the default 500 response.
    pub fn with_error_handler(mut self, handler: impl Handler) -> Self {
        self.on_panic = Some(handler.boxed());
        self
    }
}

impl<H: Handler> Handler for PanicHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let depth = writer::depth(w.as_ref());
            let outcome = AssertUnwindSafe(self.inner.serve(req, w)).catch_unwind().await;
            let Err(payload) = outcome else { return };

            // Drop whatever decorators the unwound stages left behind.
            while writer::depth(w.as_ref()) > depth {
                writer::peel(w);
            }

            let payload = PanicPayload(payload);
            error!(method = %req.method(), path = req.path(), "handler panicked: {}", payload.message());

            match &self.on_panic {
                Some(on_panic) => {
                    writer::wrap(w, |inner| Box::new(PanicWriter { inner, payload }));
                    on_panic.serve(req, w).await;
                    writer::peel(w);
                }
                None => write_error(w.as_mut(), &payload.message()),
            }
        })
    }
}

/// Best effort: once the head is on its way there is nothing left to fix.
fn write_error(w: &mut dyn ResponseWriter, message: &str) {
    if w.head_written() {
        warn!("response already started, dropping panic response");
        return;
    }
    let hdr = w.headers_mut();
    hdr.remove(header::CONTENT_ENCODING);
    hdr.remove(header::CONTENT_LENGTH);
    hdr.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    hdr.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    w.write_head(StatusCode::INTERNAL_SERVER_ERROR);

    let body = if message.is_empty() { "Internal Server Error" } else { message };
    if let Err(e) = w.write(body.as_bytes()) {
        warn!("writing panic response failed: {e}");
    }
}

/// The payload caught by the nearest [`PanicHandler`], visible to its error
/// handler.
pub fn panic_payload(w: &dyn ResponseWriter) -> Option<&PanicPayload> {
    writer::lookup::<PanicWriter>(w).map(|pw| &pw.payload)
}
