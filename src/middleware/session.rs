//! Signed-cookie sessions.
//!
//! [`SessionHandler`] recovers the session named by the request's session
//! cookie, or starts a new one, and hangs it off the response channel where
//! inner handlers reach it through [`session`]. When the wrapped handler is
//! done (or has panicked) the session is saved back to the store with its
//! time-to-live reset, so every request slides the expiration forward.
//!
//! The cookie value is the session id followed by an HMAC-SHA256 signature.
//! A cookie that is missing, malformed, or carries a bad signature counts as
//! no cookie at all. `Set-Cookie` goes out with the first status line or body
//! byte, and only when the client does not already hold the right id (or the
//! stage was told to refresh it).
//!
//! The stage is scoped to the cookie path: outside it the wrapped handler runs
//! with no session attached.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cookie::{Cookie, SameSite};
use futures_util::FutureExt;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::session::{Session, SessionStore, signing};
use crate::writer::{self, BoxWriter, ResponseWriter};

pub const DEFAULT_COOKIE_NAME: &str = "strata.sid";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Attributes of the session cookie.
#[derive(Clone, Debug)]
pub struct CookieTemplate {
    /// Empty means [`DEFAULT_COOKIE_NAME`].
    pub name: String,
    /// Scope of the stage as well as of the cookie. Empty means `/`.
    pub path: String,
    pub domain: Option<String>,
    /// Never send the cookie over a plaintext connection.
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Seconds. Also the session's time-to-live in the store. `0` makes a
    /// browser-session cookie with no store expiry.
    pub max_age: u64,
}

impl Default for CookieTemplate {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_owned(),
            path: "/".to_owned(),
            domain: None,
            secure: false,
            http_only: true,
            same_site: None,
            max_age: 0,
        }
    }
}

/// Everything a [`SessionHandler`] needs.
pub struct SessionOptions {
    store: Arc<dyn SessionStore>,
    secret: Vec<u8>,
    cookie: CookieTemplate,
    trust_proxy: bool,
    refresh_cookie: bool,
}

impl SessionOptions {
    pub fn new(store: Arc<dyn SessionStore>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            secret: secret.into(),
            cookie: CookieTemplate::default(),
            trust_proxy: false,
            refresh_cookie: false,
        }
    }

    pub fn cookie(mut self, cookie: CookieTemplate) -> Self {
        self.cookie = cookie;
        self
    }

    /// Believe `X-Forwarded-Proto: https` when deciding whether the
    /// connection is secure. Only enable behind a proxy that sets it.
    pub fn trust_proxy(mut self, yes: bool) -> Self {
        self.trust_proxy = yes;
        self
    }

    /// Re-send an unchanged cookie on every request so its client-side
    /// max-age slides along with the store TTL. Has no effect without a
    /// max-age.
    pub fn refresh_cookie(mut self, yes: bool) -> Self {
        self.refresh_cookie = yes;
        self
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Decorator carrying the request's [`Session`] and the pending cookie.
pub struct SessionWriter {
    inner: BoxWriter,
    session: Session,
    store: Arc<dyn SessionStore>,
    set_cookie: Option<HeaderValue>,
}

impl SessionWriter {
    fn emit_cookie(&mut self) {
        let Some(value) = self.set_cookie.take() else { return };
        if self.inner.head_written() {
            warn!(session = self.session.id(), "head already written, session cookie not sent");
            return;
        }
        self.inner.headers_mut().append(header::SET_COOKIE, value);
    }
}

impl ResponseWriter for SessionWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_head(&mut self, status: StatusCode) {
        self.emit_cookie();
        self.inner.write_head(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.emit_cookie();
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

// ── Stage ─────────────────────────────────────────────────────────────────────

/// Stage attaching a persistent [`Session`] to every request under the
/// cookie path.
pub struct SessionHandler<H> {
    inner: H,
    opts: SessionOptions,
}

impl<H: Handler> SessionHandler<H> {
    /// Fails with [`Error::MissingSecret`] when the signing secret is empty.
    pub fn new(inner: H, mut opts: SessionOptions) -> Result<Self, Error> {
        if opts.secret.is_empty() {
            return Err(Error::MissingSecret);
        }
        if opts.cookie.name.is_empty() {
            opts.cookie.name = DEFAULT_COOKIE_NAME.to_owned();
        }
        if opts.cookie.path.is_empty() {
            opts.cookie.path = "/".to_owned();
        }
        Ok(Self { inner, opts })
    }

    fn in_scope(&self, req: &Request) -> bool {
        req.path().starts_with(&self.opts.cookie.path)
    }

    fn is_secure(&self, req: &Request) -> bool {
        if req.is_tls() {
            return true;
        }
        self.opts.trust_proxy
            && req
                .header("x-forwarded-proto")
                .is_some_and(|p| p.trim().to_ascii_lowercase().starts_with("https"))
    }

    /// Returns the session and whether the client already holds its id.
    async fn load(&self, req: &Request) -> (Session, bool) {
        let ttl = Duration::from_secs(self.opts.cookie.max_age);
        let name = &self.opts.cookie.name;

        let Some(raw) = req.cookie(name) else {
            return (Session::new(ttl), false);
        };
        let Some(id) = signing::verify(&self.opts.secret, name, &raw) else {
            info!(cookie = %name, "session cookie failed verification");
            return (Session::new(ttl), false);
        };
        match self.opts.store.get(&id).await {
            Ok(Some(session)) => (session, true),
            Ok(None) => {
                debug!(session = %id, "session not found, starting a new one");
                (Session::new(ttl), false)
            }
            Err(e) => {
                warn!(session = %id, "loading session failed: {e}");
                (Session::new(ttl), false)
            }
        }
    }

    fn cookie_header(&self, req: &Request, session: &Session, presented: bool) -> Option<HeaderValue> {
        let tpl = &self.opts.cookie;
        let refresh = self.opts.refresh_cookie && tpl.max_age > 0;
        if presented && !refresh {
            return None;
        }
        if tpl.secure && !self.is_secure(req) {
            warn!(cookie = %tpl.name, path = req.path(), "secure session cookie over plaintext connection, not sent");
            return None;
        }

        let signed = signing::sign(&self.opts.secret, &tpl.name, session.id());
        let mut builder = Cookie::build((tpl.name.clone(), signed))
            .path(tpl.path.clone())
            .secure(tpl.secure)
            .http_only(tpl.http_only);
        if let Some(domain) = &tpl.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(same_site) = tpl.same_site {
            builder = builder.same_site(same_site);
        }
        if tpl.max_age > 0 {
            let secs = i64::try_from(tpl.max_age).unwrap_or(i64::MAX);
            builder = builder.max_age(cookie::time::Duration::seconds(secs));
        }

        match HeaderValue::try_from(builder.build().to_string()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(cookie = %tpl.name, "session cookie is not a valid header value: {e}");
                None
            }
        }
    }
}

impl<H: Handler> Handler for SessionHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if !self.in_scope(req) || writer::lookup::<SessionWriter>(w.as_ref()).is_some() {
                return self.inner.serve(req, w).await;
            }

            let (session, presented) = self.load(req).await;
            let set_cookie = self.cookie_header(req, &session, presented);
            let store = Arc::clone(&self.opts.store);
            writer::wrap(w, |inner| Box::new(SessionWriter { inner, session, store, set_cookie }));

            let outcome = AssertUnwindSafe(self.inner.serve(req, w)).catch_unwind().await;

            if let Some(sw) = writer::lookup_mut::<SessionWriter>(w.as_mut()) {
                if outcome.is_ok() {
                    sw.emit_cookie();
                }
                sw.session.reset_max_age();
                if let Err(e) = sw.store.set(sw.session.id(), &sw.session).await {
                    warn!(session = sw.session.id(), "saving session failed: {e}");
                }
            }

            match outcome {
                Ok(()) => {
                    writer::peel(w);
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }
}

/// The current request's session, if a [`SessionHandler`] further out
/// attached one.
pub fn session(w: &mut dyn ResponseWriter) -> Option<&mut Session> {
    writer::lookup_mut::<SessionWriter>(w).map(|sw| &mut sw.session)
}

/// The store the current session is saved to.
pub fn session_store(w: &dyn ResponseWriter) -> Option<Arc<dyn SessionStore>> {
    writer::lookup::<SessionWriter>(w).map(|sw| Arc::clone(&sw.store))
}
