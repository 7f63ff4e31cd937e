//! Full-stack behaviour: every stage nested around one application.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{StatusCode, header};
use strata::middleware::{
    ContextHandler, GzipHandler, LogFormat, LogSink, LoggingHandler, PanicHandler, SessionHandler,
    SessionOptions, context, session,
};
use strata::session::{MemoryStore, SessionStore};
use strata::{Handler, HandlerExt, Request, WriterExt, handler_fn, respond};

#[derive(Clone, Default)]
struct Lines(Arc<Mutex<Vec<u8>>>);

impl Write for Lines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lines {
    fn all(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn get(path: &str) -> Request {
    Request::from_http(
        http::Request::get(path)
            .header(header::ACCEPT_ENCODING, "gzip, deflate")
            .body(Bytes::new())
            .unwrap(),
    )
}

fn gunzip(body: &[u8]) -> String {
    let mut out = String::new();
    GzDecoder::new(body).read_to_string(&mut out).unwrap();
    out
}

fn fail(msg: &'static str) {
    panic!("{msg}")
}

/// Two-part application: the first half records the visit in the context, the
/// second renders it.
fn app() -> impl Handler {
    let record = handler_fn(|_req, w| Box::pin(async move {
        let visits = session(w.as_mut()).map_or(0, |s| {
            let n = s.get::<u32>("visits").unwrap_or(0) + 1;
            s.insert("visits", n).unwrap();
            n
        });
        context(w.as_mut()).unwrap().insert("visits", visits);
    }));
    let render = handler_fn(|req, w| Box::pin(async move {
        if req.path() == "/panic" {
            fail("render failed");
        }
        let visits = *context(w.as_mut()).unwrap().get::<u32>("visits").unwrap();
        w.respond(StatusCode::OK, "text/plain", format!("visit {visits}").as_bytes()).unwrap();
    }));
    ContextHandler::new(record.chain(render), 2)
}

fn stack(store: &Arc<MemoryStore>, lines: &Lines) -> impl Handler {
    PanicHandler::new(
        LoggingHandler::new(GzipHandler::new(
            SessionHandler::new(app(), SessionOptions::new(store.clone(), "s3cret")).unwrap(),
        ))
        .format(LogFormat::Tiny)
        .sink(LogSink::writer(lines.clone())),
    )
}

#[tokio::test]
async fn full_stack_round_trip() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let lines = Lines::default();
    let h = stack(&store, &lines);

    let first = respond(&h, &get("/")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[header::CONTENT_ENCODING], "gzip");
    assert_eq!(first.headers()[header::VARY], "Accept-Encoding");
    assert_eq!(gunzip(first.body()), "visit 1");

    let cookie = first.headers()[header::SET_COOKIE].to_str().unwrap();
    let cookie = cookie.split(';').next().unwrap().to_owned();
    let mut again = http::Request::get("/")
        .header(header::ACCEPT_ENCODING, "gzip")
        .header(header::COOKIE, cookie)
        .body(Bytes::new())
        .unwrap();
    again.headers_mut().append(header::COOKIE, "other=1".parse().unwrap());
    let second = respond(&h, &Request::from_http(again)).await;

    assert_eq!(gunzip(second.body()), "visit 2");
    assert!(!second.headers().contains_key(header::SET_COOKIE));
    assert_eq!(store.count().await, 1);

    let logged = lines.all();
    assert_eq!(logged.len(), 2);
    assert!(logged[0].starts_with("GET / 200 "), "{}", logged[0]);
}

#[tokio::test]
async fn panic_deep_in_stack_is_contained() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let lines = Lines::default();
    let h = stack(&store, &lines);

    let res = respond(&h, &get("/panic")).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!res.headers().contains_key(header::CONTENT_ENCODING));
    assert_eq!(res.body().as_ref(), b"render failed");

    // Logging and session persistence still ran on the way out.
    assert_eq!(lines.all().len(), 1);
    assert_eq!(store.count().await, 1);

    let ok = respond(&h, &get("/")).await;
    assert_eq!(ok.status(), StatusCode::OK);
}

#[tokio::test]
async fn doubled_stages_behave_like_single() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let opts = || SessionOptions::new(store.clone(), "s3cret");
    let lines = Lines::default();

    let inner = LoggingHandler::new(GzipHandler::new(SessionHandler::new(app(), opts()).unwrap()))
        .sink(LogSink::writer(lines.clone()));
    let doubled = LoggingHandler::new(GzipHandler::new(
        SessionHandler::new(ContextHandler::new(inner, 2), opts()).unwrap(),
    ))
    .sink(LogSink::writer(lines.clone()));

    let res = respond(&doubled, &get("/")).await;
    assert_eq!(gunzip(res.body()), "visit 1");
    assert_eq!(res.headers().get_all(header::SET_COOKIE).iter().count(), 1);
    assert_eq!(res.headers().get_all(header::VARY).iter().count(), 1);
    assert_eq!(lines.all().len(), 1);
    assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn stage_order_does_not_change_output() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let opts = || SessionOptions::new(store.clone(), "s3cret");

    let a = GzipHandler::new(SessionHandler::new(app(), opts()).unwrap());
    let b = SessionHandler::new(GzipHandler::new(app()), opts()).unwrap();

    let ra = respond(&a, &get("/")).await;
    let rb = respond(&b, &get("/")).await;
    assert_eq!(gunzip(ra.body()), gunzip(rb.body()));
    assert!(ra.headers().contains_key(header::SET_COOKIE));
    assert!(rb.headers().contains_key(header::SET_COOKIE));
}

#[tokio::test]
async fn concurrent_requests_are_isolated() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let lines = Lines::default();
    let h = Arc::new(stack(&store, &lines));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                let path = if i % 4 == 0 { "/panic" } else { "/" };
                respond(&h, &get(path)).await.status()
            })
        })
        .collect();

    let mut errors = 0;
    for t in tasks {
        if t.await.unwrap() == StatusCode::INTERNAL_SERVER_ERROR {
            errors += 1;
        }
    }
    assert_eq!(errors, 4);
    assert_eq!(store.count().await, 16);
    assert_eq!(lines.all().len(), 16);
}
