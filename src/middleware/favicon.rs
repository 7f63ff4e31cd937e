//! Serves `/favicon.ico` from a file on disk.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use tokio::sync::OnceCell;
use tracing::warn;

use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::writer::BoxWriter;

const FAVICON_PATH: &str = "/favicon.ico";

/// Stage answering `/favicon.ico` itself and passing every other path on.
///
/// The icon is read on first use and kept in memory from then on. A failed
/// read is logged, answered with `404`, and retried on the next request.
pub struct FaviconHandler<H> {
    inner: H,
    file: PathBuf,
    cache_control: HeaderValue,
    icon: OnceCell<Bytes>,
}

impl<H: Handler> FaviconHandler<H> {
    /// `max_age` is advertised in `Cache-Control`, rounded down to seconds.
    pub fn new(inner: H, file: impl Into<PathBuf>, max_age: Duration) -> Self {
        let cache_control = HeaderValue::from_str(&format!("public, max-age={}", max_age.as_secs()))
            .unwrap_or_else(|_| HeaderValue::from_static("public"));
        Self { inner, file: file.into(), cache_control, icon: OnceCell::new() }
    }

    async fn icon(&self) -> std::io::Result<&Bytes> {
        self.icon
            .get_or_try_init(|| async { tokio::fs::read(&self.file).await.map(Bytes::from) })
            .await
    }
}

impl<H: Handler> Handler for FaviconHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if req.path() != FAVICON_PATH {
                return self.inner.serve(req, w).await;
            }

            let icon = match self.icon().await {
                Ok(icon) => icon,
                Err(e) => {
                    warn!(file = %self.file.display(), "reading favicon failed: {e}");
                    w.write_head(StatusCode::NOT_FOUND);
                    return;
                }
            };

            let hdr = w.headers_mut();
            hdr.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/x-icon"));
            hdr.insert(header::CONTENT_LENGTH, HeaderValue::from(icon.len()));
            hdr.insert(header::CACHE_CONTROL, self.cache_control.clone());
            w.write_head(StatusCode::OK);
            if let Err(e) = w.write(icon) {
                warn!("writing favicon failed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, respond};
    use crate::writer::WriterExt;

    fn get(path: &str) -> Request {
        Request::from_http(http::Request::get(path).body(Bytes::new()).unwrap())
    }

    fn app() -> impl Handler {
        handler_fn(|_req, w| Box::pin(async move { w.write_str("app").unwrap() }))
    }

    #[tokio::test]
    async fn serves_icon_with_cache_headers() {
        let file = std::env::temp_dir().join(format!("strata-favicon-{}.ico", std::process::id()));
        std::fs::write(&file, b"\x00\x00\x01\x00icon").unwrap();

        let h = FaviconHandler::new(app(), &file, Duration::from_secs(86_400));
        let res = respond(&h, &get("/favicon.ico")).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/x-icon");
        assert_eq!(res.headers()[header::CONTENT_LENGTH], "8");
        assert_eq!(res.headers()[header::CACHE_CONTROL], "public, max-age=86400");
        assert_eq!(res.body().as_ref(), b"\x00\x00\x01\x00icon");

        // Cached: deleting the file changes nothing.
        std::fs::remove_file(&file).unwrap();
        let again = respond(&h, &get("/favicon.ico")).await;
        assert_eq!(again.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let h = FaviconHandler::new(app(), "/nonexistent/strata/favicon.ico", Duration::ZERO);
        let res = respond(&h, &get("/favicon.ico")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_paths_pass_through() {
        let h = FaviconHandler::new(app(), "/nonexistent/strata/favicon.ico", Duration::ZERO);
        let res = respond(&h, &get("/index.html")).await;
        assert_eq!(res.body().as_ref(), b"app");
    }
}
