//! Gzip response compression.
//!
//! # Negotiation
//!
//! Nothing happens for `HEAD` requests or when the request carries no
//! `Accept-Encoding`. Otherwise compression is on the table when any
//! `Accept-Encoding` value, trimmed and lowercased, contains `gzip` or is
//! exactly `*`.
//!
//! The final call is deferred to the first `write_head` / `write` of the
//! wrapped handler, because only then is its `Content-Type` known. At that
//! point the content-type filter (see [`default_filter`]) decides. When it
//! says yes the stage sets `Content-Encoding: gzip`, drops `Content-Length`
//! and lists `Accept-Encoding` in `Vary`; when it says no, bytes go through
//! untouched and no header is changed.
//!
//! The compressed stream is finished only when the wrapped handler returns
//! normally. A panicking handler leaves the stream unfinished; the panic stage
//! further out produces the error response.

use std::any::Any;
use std::io::{self, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tracing::warn;

use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::writer::{self, BoxWriter, ResponseWriter};

/// Decides from the response `Content-Type` (if any) whether to compress.
pub type ContentTypeFilter = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Compresses anything textual: content types containing `text`,
/// `javascript` or `json`, and responses that did not declare a type.
pub fn default_filter(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ["text", "javascript", "json"].iter().any(|kind| ct.contains(kind))
        }
    }
}

/// `true` if any `Accept-Encoding` value admits gzip.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .any(|v| v == "*" || v.contains("gzip"))
}

// ── Writer ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undecided,
    Compress,
    Passthrough,
}

/// Decorator routing body bytes through a gzip encoder.
pub struct GzipWriter {
    inner: BoxWriter,
    encoder: GzEncoder<Vec<u8>>,
    filter: ContentTypeFilter,
    mode: Mode,
}

impl GzipWriter {
    fn new(inner: BoxWriter, filter: ContentTypeFilter) -> Self {
        Self {
            inner,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            filter,
            mode: Mode::Undecided,
        }
    }

    /// `true` once the filter accepted the response and headers were set.
    pub fn is_compressing(&self) -> bool {
        self.mode == Mode::Compress
    }

    fn decide(&mut self, status: StatusCode) {
        if self.mode != Mode::Undecided {
            return;
        }
        let bodiless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if bodiless || self.inner.head_written() {
            self.mode = Mode::Passthrough;
            return;
        }

        let hdr = self.inner.headers_mut();
        let content_type = hdr.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if hdr.contains_key(header::CONTENT_ENCODING) || !(self.filter)(content_type) {
            self.mode = Mode::Passthrough;
            return;
        }
        set_gzip_headers(hdr);
        self.mode = Mode::Compress;
    }

    /// Moves whatever the encoder produced so far into the inner writer.
    fn drain(&mut self) -> io::Result<()> {
        let out = std::mem::take(self.encoder.get_mut());
        if out.is_empty() {
            return Ok(());
        }
        self.inner.write(&out)
    }

    /// Writes the gzip trailer. A no-op unless compression actually started.
    fn finish(&mut self) -> io::Result<()> {
        if self.mode != Mode::Compress {
            return Ok(());
        }
        self.encoder.try_finish()?;
        self.drain()
    }
}

impl ResponseWriter for GzipWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_head(&mut self, status: StatusCode) {
        self.decide(status);
        self.inner.write_head(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.decide(StatusCode::OK);
        if self.mode != Mode::Compress {
            return self.inner.write(buf);
        }
        self.encoder.write_all(buf)?;
        self.drain()
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

fn set_gzip_headers(hdr: &mut HeaderMap) {
    hdr.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    // Compressed length is unknown upfront.
    hdr.remove(header::CONTENT_LENGTH);

    let listed = hdr
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("accept-encoding"));
    if !listed {
        hdr.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// Stage compressing the wrapped handler's response with gzip.
pub struct GzipHandler<H> {
    inner: H,
    filter: ContentTypeFilter,
}

impl<H: Handler> GzipHandler<H> {
    /// Uses [`default_filter`].
    pub fn new(inner: H) -> Self {
        Self { inner, filter: Arc::new(default_filter) }
    }

    /// Replaces the content-type filter.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }
}

impl<H: Handler> Handler for GzipHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            let already = writer::lookup::<GzipWriter>(w.as_ref()).is_some();
            if already || req.method() == Method::HEAD || !accepts_gzip(req.headers()) {
                return self.inner.serve(req, w).await;
            }

            let filter = Arc::clone(&self.filter);
            writer::wrap(w, |inner| Box::new(GzipWriter::new(inner, filter)));
            self.inner.serve(req, w).await;

            if let Some(gz) = writer::lookup_mut::<GzipWriter>(w.as_mut()) {
                if let Err(e) = gz.finish() {
                    warn!(path = req.path(), "gzip: finishing compressed stream failed: {e}");
                }
            }
            writer::peel(w);
        })
    }
}
