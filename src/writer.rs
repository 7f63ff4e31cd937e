//! The response channel and its decorator chain.
//!
//! # How stages find each other
//!
//! Every request gets exactly one [`ResponseBuffer`]. Stages that need to see
//! or rewrite the outgoing response install a *decorator* around it: a
//! [`ResponseWriter`] that owns the next-inner writer as a [`BoxWriter`] and
//! forwards everything it does not care about.
//!
//! ```text
//! handler holds ─► SessionWriter ─► GzipWriter ─► StatusWriter ─► ResponseBuffer
//!                  (outermost)                                    (innermost)
//! ```
//!
//! Ownership makes the chain strict: each decorator exclusively owns the one
//! below it, so there are no cycles and nothing is shared across requests.
//! Inner code discovers outer state by walking [`ResponseWriter::wrapped`]
//! until a writer of the wanted type turns up (see [`lookup`]). There is no
//! request-indexed table anywhere and therefore nothing to lock.
//!
//! A stage that installs a decorator with [`wrap`] removes it with [`peel`]
//! once the wrapped handler returns normally.

use std::any::Any;
use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::debug;

/// An owned, type-erased response channel.
pub type BoxWriter = Box<dyn ResponseWriter>;

// ── The channel contract ──────────────────────────────────────────────────────

/// The mutable output side of one request.
///
/// Decorators must forward every operation they do not intercept to the
/// writer they wrap, expose that writer through [`wrapped`](Self::wrapped),
/// and hand it back from [`into_wrapped`](Self::into_wrapped).
pub trait ResponseWriter: Any + Send + 'static {
    /// Response headers that have not been committed yet.
    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commits the status line and the current headers. Only the first call
    /// has any effect.
    fn write_head(&mut self, status: StatusCode);

    /// Appends body bytes, committing `200 OK` first if no status was written.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// `true` once the status line and headers are committed.
    fn head_written(&self) -> bool;

    /// The next-inner writer, or `None` for the innermost one.
    fn wrapped(&self) -> Option<&dyn ResponseWriter> {
        None
    }

    fn wrapped_mut(&mut self) -> Option<&mut dyn ResponseWriter> {
        None
    }

    /// Drops this decorator and returns the writer it wrapped. The innermost
    /// writer returns itself as `Err`.
    fn into_wrapped(self: Box<Self>) -> Result<BoxWriter, BoxWriter>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ── Chain manipulation ────────────────────────────────────────────────────────

/// Installs a new outermost decorator built by `decorate` around `w`.
pub fn wrap<F>(w: &mut BoxWriter, decorate: F)
where
    F: FnOnce(BoxWriter) -> BoxWriter,
{
    let inner = std::mem::replace(w, Box::new(Detached::default()));
    *w = decorate(inner);
}

/// Removes the outermost decorator. Returns `false` when `w` is already the
/// innermost writer.
pub fn peel(w: &mut BoxWriter) -> bool {
    let outer = std::mem::replace(w, Box::new(Detached::default()));
    match outer.into_wrapped() {
        Ok(inner) => {
            *w = inner;
            true
        }
        Err(innermost) => {
            *w = innermost;
            false
        }
    }
}

/// Number of decorators stacked on top of the innermost writer.
pub fn depth(w: &dyn ResponseWriter) -> usize {
    let mut n = 0;
    let mut cur = w.wrapped();
    while let Some(next) = cur {
        n += 1;
        cur = next.wrapped();
    }
    n
}

/// Walks outward-to-inward and returns the first writer matching `pred`.
pub fn find<'w, P>(w: &'w dyn ResponseWriter, pred: P) -> Option<&'w dyn ResponseWriter>
where
    P: Fn(&dyn ResponseWriter) -> bool,
{
    let mut cur = Some(w);
    while let Some(candidate) = cur {
        if pred(candidate) {
            return Some(candidate);
        }
        cur = candidate.wrapped();
    }
    None
}

/// Mutable counterpart of [`find`].
pub fn find_mut<'w>(
    w: &'w mut dyn ResponseWriter,
    pred: &dyn Fn(&dyn ResponseWriter) -> bool,
) -> Option<&'w mut dyn ResponseWriter> {
    if pred(&*w) {
        return Some(w);
    }
    match w.wrapped_mut() {
        Some(inner) => find_mut(inner, pred),
        None => None,
    }
}

/// Typed capability query: the first writer in the chain whose concrete type
/// is `T`.
pub fn lookup<T: ResponseWriter>(w: &dyn ResponseWriter) -> Option<&T> {
    find(w, |c| c.as_any().is::<T>())?.as_any().downcast_ref::<T>()
}

pub fn lookup_mut<T: ResponseWriter>(w: &mut dyn ResponseWriter) -> Option<&mut T> {
    find_mut(w, &|c| c.as_any().is::<T>())?.as_any_mut().downcast_mut::<T>()
}

// ── Innermost writer ──────────────────────────────────────────────────────────

/// The innermost writer: buffers the status, headers and body of one response.
///
/// Headers are snapshotted when the head is committed. Changes made after that
/// point are silently dropped, exactly as they would be once bytes are on the
/// wire.
#[derive(Default)]
pub struct ResponseBuffer {
    headers: HeaderMap,
    head: Option<(StatusCode, HeaderMap)>,
    body: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(status, _)| *status)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Finishes the response. A handler that wrote nothing yields an empty
    /// `200 OK`.
    pub fn into_response(self) -> http::Response<Bytes> {
        let (status, headers) = match self.head {
            Some(head) => head,
            None => (StatusCode::OK, self.headers),
        };
        let mut res = http::Response::new(Bytes::from(self.body));
        *res.status_mut() = status;
        *res.headers_mut() = headers;
        res
    }
}

impl ResponseWriter for ResponseBuffer {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if let Some((committed, _)) = &self.head {
            debug!(%committed, ignored = %status, "superfluous write_head");
            return;
        }
        self.head = Some((status, self.headers.clone()));
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.head.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(())
    }

    fn head_written(&self) -> bool {
        self.head.is_some()
    }

    fn into_wrapped(self: Box<Self>) -> Result<BoxWriter, BoxWriter> {
        Err(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Stand-in that occupies a [`BoxWriter`] slot for the instant between taking
/// the old writer out and putting the decorated one back.
#[derive(Default)]
struct Detached {
    headers: HeaderMap,
}

impl ResponseWriter for Detached {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, _status: StatusCode) {}

    fn write(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "response writer detached"))
    }

    fn head_written(&self) -> bool {
        true
    }

    fn into_wrapped(self: Box<Self>) -> Result<BoxWriter, BoxWriter> {
        Err(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ── Convenience ───────────────────────────────────────────────────────────────

/// Shortcuts available on every writer, boxed or not.
pub trait WriterExt: ResponseWriter {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.write(s.as_bytes())
    }

    /// Sets `content-type`, commits `status` and writes `body` in one go.
    fn respond(
        &mut self,
        status: StatusCode,
        content_type: &'static str,
        body: &[u8],
    ) -> io::Result<()> {
        self.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.write_head(status);
        self.write(body)
    }
}

impl<W: ResponseWriter + ?Sized> WriterExt for W {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal decorator used to exercise the chain helpers.
    struct Tag {
        inner: BoxWriter,
        label: &'static str,
    }

    impl ResponseWriter for Tag {
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

    fn tag(label: &'static str) -> impl FnOnce(BoxWriter) -> BoxWriter {
        move |inner| Box::new(Tag { inner, label })
    }

    #[test]
    fn wrap_and_peel_track_depth() {
        let mut w: BoxWriter = Box::new(ResponseBuffer::new());
        assert_eq!(depth(w.as_ref()), 0);

        wrap(&mut w, tag("a"));
        wrap(&mut w, tag("b"));
        assert_eq!(depth(w.as_ref()), 2);

        assert!(peel(&mut w));
        assert!(peel(&mut w));
        assert!(!peel(&mut w));
        assert!(w.as_any().is::<ResponseBuffer>());
    }

    #[test]
    fn lookup_returns_outermost_match() {
        let mut w: BoxWriter = Box::new(ResponseBuffer::new());
        wrap(&mut w, tag("inner"));
        wrap(&mut w, tag("outer"));

        assert_eq!(lookup::<Tag>(w.as_ref()).map(|t| t.label), Some("outer"));
        assert!(lookup::<ResponseBuffer>(w.as_ref()).is_some());

        let inner = find(w.as_ref(), |c| {
            c.as_any().downcast_ref::<Tag>().is_some_and(|t| t.label == "inner")
        });
        assert!(inner.is_some());
    }

    #[test]
    fn lookup_mut_reaches_innermost_buffer() {
        let mut w: BoxWriter = Box::new(ResponseBuffer::new());
        wrap(&mut w, tag("x"));
        w.write_str("hello").unwrap();

        let buf = lookup_mut::<ResponseBuffer>(w.as_mut()).unwrap();
        assert_eq!(buf.body(), b"hello");
        assert_eq!(buf.status(), Some(StatusCode::OK));
    }

    #[test]
    fn headers_after_commit_are_ignored() {
        let mut buf = ResponseBuffer::new();
        buf.headers_mut().insert("x-before", HeaderValue::from_static("1"));
        buf.write_head(StatusCode::CREATED);
        buf.headers_mut().insert("x-after", HeaderValue::from_static("1"));
        buf.write_head(StatusCode::BAD_REQUEST);

        let res = buf.into_response();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(res.headers().contains_key("x-before"));
        assert!(!res.headers().contains_key("x-after"));
    }

    #[test]
    fn untouched_buffer_is_empty_ok() {
        let res = ResponseBuffer::new().into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.body().is_empty());
    }
}
