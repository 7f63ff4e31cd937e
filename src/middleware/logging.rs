//! Access logging.
//!
//! One line per request, rendered from a template and an ordered list of
//! tokens. The template uses Rust-style positional slots: `{}` for a plain
//! value and `{:.N}` for a number with `N` decimals; `{{` and `}}` are
//! literal braces. Slot *i* is filled with the value of token *i*.
//!
//! | Token | Value |
//! |---|---|
//! | `remote-addr` | peer address |
//! | `date` | current time, formatted with the configured strftime pattern |
//! | `method` | request method |
//! | `url` | path and query |
//! | `path` | path only |
//! | `http-version` | `1.1`, `2.0`, … |
//! | `status` | response status, captured on the first `write_head` / `write` |
//! | `size` | body bytes written by the wrapped handler |
//! | `response-time` | seconds since the stage was entered |
//! | `referrer` / `referer` | `Referer` request header |
//! | `user-agent` | `User-Agent` request header |
//! | `req[Name]` / `res[Name]` | any request / response header |
//!
//! Any other token is looked up among the custom tokens registered with
//! [`LoggingHandler::token`]. Whatever still has no value prints as `?`.
//!
//! By default the line is written after the wrapped handler finishes, even
//! when it panics. In immediate mode it is written before the handler runs,
//! so `status` and `size` are unknown.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Write};
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::format::{Item, StrftimeItems};
use futures_util::FutureExt;
use http::{HeaderMap, StatusCode, Version, header};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::writer::{self, BoxWriter, ResponseWriter};

const PLACEHOLDER: &str = "?";
const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Value source for a token the stage does not know itself.
pub type CustomToken = Box<dyn Fn(&Request, &dyn ResponseWriter) -> String + Send + Sync>;

// ── Formats ───────────────────────────────────────────────────────────────────

/// Which line layout to use.
pub enum LogFormat {
    /// `remote - - [date] "METHOD url HTTP/v" status size "referrer" "user-agent"`
    Default,
    /// `remote - METHOD url HTTP/v status size - 0.123 s`
    Short,
    /// `METHOD url status size - 0.123 s`
    Tiny,
    Custom { template: String, tokens: Vec<String> },
}

impl LogFormat {
    pub fn custom<I, S>(template: impl Into<String>, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Custom {
            template: template.into(),
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Looks up a predefined format by name: `default`, `short` or `tiny`.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "short" => Some(Self::Short),
            "tiny" => Some(Self::Tiny),
            _ => None,
        }
    }

    fn compile(self) -> Compiled {
        let (template, tokens): (&str, &[&str]) = match self {
            Self::Custom { template, tokens } => {
                return Compiled { segments: parse_template(&template), tokens };
            }
            Self::Default => (
                r#"{} - - [{}] "{} {} HTTP/{}" {} {} "{}" "{}""#,
                &["remote-addr", "date", "method", "url", "http-version", "status", "size", "referrer", "user-agent"],
            ),
            Self::Short => (
                "{} - {} {} HTTP/{} {} {} - {:.3} s",
                &["remote-addr", "method", "url", "http-version", "status", "size", "response-time"],
            ),
            Self::Tiny => (
                "{} {} {} {} - {:.3} s",
                &["method", "url", "status", "size", "response-time"],
            ),
        };
        Compiled {
            segments: parse_template(template),
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Slot { precision: Option<usize> },
}

struct Compiled {
    segments: Vec<Segment>,
    tokens: Vec<String>,
}

fn parse_template(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut slot_text = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    slot_text.push(c);
                }
                match parse_slot(&slot_text).filter(|_| closed) {
                    Some(precision) => {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        segments.push(Segment::Slot { precision });
                    }
                    None => {
                        literal.push('{');
                        literal.push_str(&slot_text);
                        if closed {
                            literal.push('}');
                        }
                    }
                }
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// `""` → plain slot, `":.N"` → slot with precision `N`.
fn parse_slot(slot_text: &str) -> Option<Option<usize>> {
    if slot_text.is_empty() {
        return Some(None);
    }
    slot_text.strip_prefix(":.")?.parse().ok().map(Some)
}

enum Value {
    Text(String),
    Int(u64),
    Float(f64),
}

impl Value {
    fn render(&self, precision: Option<usize>, out: &mut String) {
        match (self, precision) {
            (Self::Text(s), _) => out.push_str(s),
            (Self::Int(n), _) => out.push_str(&n.to_string()),
            (Self::Float(f), Some(p)) => out.push_str(&format!("{f:.p$}")),
            (Self::Float(f), None) => out.push_str(&f.to_string()),
        }
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Where access lines go.
pub enum LogSink {
    /// One `info` event per line on target `strata::access`.
    Tracing,
    Writer(Mutex<Box<dyn Write + Send>>),
}

impl LogSink {
    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self::Writer(Mutex::new(Box::new(w)))
    }

    fn emit(&self, line: &str) {
        match self {
            Self::Tracing => info!(target: "strata::access", "{line}"),
            Self::Writer(w) => {
                if let Err(e) = writeln!(w.lock(), "{line}") {
                    warn!("access log write failed: {e}");
                }
            }
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Decorator recording the response status and body size for the log line.
pub struct StatusWriter {
    inner: BoxWriter,
    status: Option<StatusCode>,
    size: u64,
}

impl StatusWriter {
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl ResponseWriter for StatusWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_head(&mut self, status: StatusCode) {
        self.status.get_or_insert(status);
        self.inner.write_head(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.status.get_or_insert(StatusCode::OK);
        self.inner.write(buf)?;
        self.size += buf.len() as u64;
        Ok(())
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

/// Stage writing one access line per request.
pub struct LoggingHandler<H> {
    inner: H,
    sink: LogSink,
    format: Compiled,
    custom: HashMap<String, CustomToken>,
    immediate: bool,
    date_format: String,
}

impl<H: Handler> LoggingHandler<H> {
    /// [`LogFormat::Default`] to [`LogSink::Tracing`], logged on completion.
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            sink: LogSink::Tracing,
            format: LogFormat::Default.compile(),
            custom: HashMap::new(),
            immediate: false,
            date_format: DEFAULT_DATE_FORMAT.to_owned(),
        }
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format.compile();
        self
    }

    pub fn sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Log before the wrapped handler runs instead of after.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// strftime pattern for the `date` token.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` contains an unknown conversion specifier.
    pub fn date_format(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let valid = StrftimeItems::new(&pattern).all(|item| !matches!(item, Item::Error));
        assert!(valid, "invalid date format `{pattern}`");
        self.date_format = pattern;
        self
    }

    /// Registers a value source for a token the stage does not know.
    pub fn token<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Request, &dyn ResponseWriter) -> String + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Box::new(f));
        self
    }

    fn log(&self, req: &Request, w: &dyn ResponseWriter, start: Instant) {
        let mut line = String::new();
        let mut slot = 0;
        for segment in &self.format.segments {
            match segment {
                Segment::Literal(s) => line.push_str(s),
                Segment::Slot { precision } => {
                    let value = self
                        .format
                        .tokens
                        .get(slot)
                        .and_then(|t| self.resolve(t, req, w, start));
                    match value {
                        Some(v) => v.render(*precision, &mut line),
                        None => line.push_str(PLACEHOLDER),
                    }
                    slot += 1;
                }
            }
        }
        self.sink.emit(&line);
    }

    fn resolve(&self, token: &str, req: &Request, w: &dyn ResponseWriter, start: Instant) -> Option<Value> {
        if let Some(v) = predefined(token, req, w, start, &self.date_format) {
            return Some(v);
        }
        self.custom.get(token).map(|f| Value::Text(f(req, w)))
    }
}

fn predefined(token: &str, req: &Request, w: &dyn ResponseWriter, start: Instant, date_format: &str) -> Option<Value> {
    let text = |s: &str| Some(Value::Text(s.to_owned()));
    match token {
        "remote-addr" => return req.remote_addr().map(|a| Value::Text(a.to_string())),
        "date" => return Some(Value::Text(chrono::Utc::now().format(date_format).to_string())),
        "method" => return text(req.method().as_str()),
        "url" => return Some(Value::Text(req.uri().to_string())),
        "path" => return text(req.path()),
        "http-version" => return text(version_number(req.version())),
        "response-time" => return Some(Value::Float(start.elapsed().as_secs_f64())),
        "referrer" | "referer" => return text(req.header(header::REFERER.as_str()).unwrap_or_default()),
        "user-agent" => return text(req.header(header::USER_AGENT.as_str()).unwrap_or_default()),
        "status" => {
            let status = writer::lookup::<StatusWriter>(w).and_then(StatusWriter::status)?;
            return Some(Value::Int(u64::from(status.as_u16())));
        }
        "size" => return writer::lookup::<StatusWriter>(w).map(|sw| Value::Int(sw.size())),
        _ => {}
    }

    let (side, name) = token.strip_suffix(']')?.split_once('[')?;
    let headers = match side {
        "req" => req.headers(),
        "res" => w.headers(),
        _ => return None,
    };
    let value = headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default();
    text(value)
}

fn version_number(v: Version) -> &'static str {
    match v {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

impl<H: Handler> Handler for LoggingHandler<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut BoxWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if writer::lookup::<StatusWriter>(w.as_ref()).is_some() {
                return self.inner.serve(req, w).await;
            }

            let start = Instant::now();
            if self.immediate {
                self.log(req, w.as_ref(), start);
            }

            writer::wrap(w, |inner| Box::new(StatusWriter { inner, status: None, size: 0 }));
            let outcome = AssertUnwindSafe(self.inner.serve(req, w)).catch_unwind().await;
            if !self.immediate {
                self.log(req, w.as_ref(), start);
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::HeaderValue;

    use super::*;
    use crate::handler::{handler_fn, respond};
    use crate::middleware::panic::PanicHandler;
    use crate::writer::WriterExt;

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn request() -> Request {
        Request::from_http(
            http::Request::get("/log?x=1")
                .header(header::REFERER, "http://www.test.com")
                .header(header::USER_AGENT, "strata-test")
                .header("x-request-id", "abc")
                .body(Bytes::new())
                .unwrap(),
        )
        .with_remote_addr("127.0.0.1:4242".parse().unwrap())
    }

    fn body() -> impl Handler {
        handler_fn(|_req, w| Box::pin(async move {
            w.headers_mut().insert("x-served-by", HeaderValue::from_static("node-1"));
            w.write_head(StatusCode::CREATED);
            w.write_str("body").unwrap();
        }))
    }

    async fn line(format: LogFormat) -> String {
        let out = Captured::default();
        let h = LoggingHandler::new(body())
            .format(format)
            .sink(LogSink::writer(out.clone()));
        respond(&h, &request()).await;
        out.text()
    }

    #[tokio::test]
    async fn predefined_tokens() {
        let cases = [
            ("remote-addr", "127.0.0.1:4242"),
            ("method", "GET"),
            ("url", "/log?x=1"),
            ("path", "/log"),
            ("http-version", "1.1"),
            ("status", "201"),
            ("size", "4"),
            ("referrer", "http://www.test.com"),
            ("referer", "http://www.test.com"),
            ("user-agent", "strata-test"),
            ("req[X-Request-Id]", "abc"),
            ("res[X-Served-By]", "node-1"),
            ("bidon", "?"),
        ];
        for (token, expected) in cases {
            let got = line(LogFormat::custom("{}", [token])).await;
            assert_eq!(got, format!("{expected}\n"), "token {token}");
        }
    }

    #[tokio::test]
    async fn date_uses_pattern() {
        let got = line(LogFormat::custom("{}", ["date"])).await;
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert!(got.starts_with(&today), "{got}");

        let out = Captured::default();
        let h = LoggingHandler::new(body())
            .format(LogFormat::custom("[{}]", ["date"]))
            .date_format("%Y")
            .sink(LogSink::writer(out.clone()));
        respond(&h, &request()).await;
        assert_eq!(out.text(), format!("[{}]\n", chrono::Utc::now().format("%Y")));
    }

    #[tokio::test]
    async fn response_time_with_precision() {
        let got = line(LogFormat::custom("{:.3} s", ["response-time"])).await;
        let secs = got.trim_end().strip_suffix(" s").unwrap();
        assert_eq!(secs.split('.').nth(1).map(str::len), Some(3));
    }

    #[tokio::test]
    async fn tiny_format() {
        let got = line(LogFormat::Tiny).await;
        assert!(got.starts_with("GET /log?x=1 201 4 - "), "{got}");
        assert!(got.ends_with(" s\n"));
    }

    #[tokio::test]
    async fn default_format() {
        let got = line(LogFormat::named("default").unwrap()).await;
        assert!(got.starts_with("127.0.0.1:4242 - - ["), "{got}");
        let tail = r#"] "GET /log?x=1 HTTP/1.1" 201 4 "http://www.test.com" "strata-test""#;
        assert!(got.ends_with(&format!("{tail}\n")), "{got}");
    }

    #[tokio::test]
    async fn custom_tokens_and_escapes() {
        let out = Captured::default();
        let h = LoggingHandler::new(body())
            .format(LogFormat::custom("{{{}}} {}", ["tenant", "missing"]))
            .token("tenant", |req, _w| req.header("x-request-id").unwrap_or("-").to_owned())
            .sink(LogSink::writer(out.clone()));
        respond(&h, &request()).await;
        assert_eq!(out.text(), "{abc} ?\n");
    }

    #[tokio::test]
    async fn immediate_mode_has_no_status() {
        let out = Captured::default();
        let h = LoggingHandler::new(body())
            .format(LogFormat::custom("{} {} {}", ["method", "status", "size"]))
            .immediate(true)
            .sink(LogSink::writer(out.clone()));
        let res = respond(&h, &request()).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(out.text(), "GET ? ?\n");
    }

    #[tokio::test]
    async fn implicit_ok_is_captured() {
        let out = Captured::default();
        let h = LoggingHandler::new(handler_fn(|_req, w| Box::pin(async move {
            w.write_str("hi").unwrap();
        })))
        .format(LogFormat::custom("{}", ["status"]))
        .sink(LogSink::writer(out.clone()));
        respond(&h, &request()).await;
        assert_eq!(out.text(), "200\n");
    }

    #[tokio::test]
    async fn logs_even_when_handler_panics() {
        let out = Captured::default();
        let boom = handler_fn(|_req, _w| Box::pin(async move { explode() }));
        let h = PanicHandler::new(
            LoggingHandler::new(boom)
                .format(LogFormat::custom("{} {}", ["path", "status"]))
                .sink(LogSink::writer(out.clone())),
        );
        let res = respond(&h, &request()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(out.text(), "/log ?\n");
    }

    fn explode() {
        panic!("boom")
    }

    #[tokio::test]
    async fn double_wrapping_logs_once() {
        let out = Captured::default();
        let h = LoggingHandler::new(
            LoggingHandler::new(body()).sink(LogSink::writer(out.clone())),
        )
        .format(LogFormat::Tiny)
        .sink(LogSink::writer(out.clone()));
        respond(&h, &request()).await;
        assert_eq!(out.text().lines().count(), 1);
    }

    #[test]
    #[should_panic(expected = "invalid date format")]
    fn bad_date_format_fails_fast() {
        let _ = LoggingHandler::new(body()).date_format("%Y-%");
    }

    #[test]
    fn template_parsing() {
        assert_eq!(
            parse_template("a {} b {:.2}{x}"),
            vec![
                Segment::Literal("a ".into()),
                Segment::Slot { precision: None },
                Segment::Literal(" b ".into()),
                Segment::Slot { precision: Some(2) },
                Segment::Literal("{x}".into()),
            ]
        );
        assert_eq!(parse_template("{"), vec![Segment::Literal("{".into())]);
    }
}
