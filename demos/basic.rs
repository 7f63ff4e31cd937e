//! Minimal strata example: a visit counter behind the full middleware stack.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -c jar -b jar http://localhost:3000/
//!   curl -c jar -b jar --compressed http://localhost:3000/
//!   curl http://localhost:3000/boom

use std::sync::Arc;
use std::time::Duration;

use strata::middleware::{
    ContextHandler, CookieTemplate, FaviconHandler, GzipHandler, LogFormat, LoggingHandler,
    PanicHandler, SessionHandler, SessionOptions, context, session,
};
use strata::session::MemoryStore;
use strata::{HandlerExt, Server, WriterExt, handler_fn};

#[tokio::main]
async fn main() -> Result<(), strata::Error> {
    tracing_subscriber::fmt::init();

    // First half of the chain: count the visit and leave it in the context.
    let count = handler_fn(|_req, w| Box::pin(async move {
        let visits = match session(w.as_mut()) {
            Some(s) => {
                let n = s.get::<u64>("visits").unwrap_or(0) + 1;
                if let Err(e) = s.insert("visits", n) {
                    tracing::warn!("storing visit count failed: {e}");
                }
                n
            }
            None => 0,
        };
        if let Some(ctx) = context(w.as_mut()) {
            ctx.insert("visits", visits);
        }
    }));

    // Second half: render.
    let render = handler_fn(|req, w| Box::pin(async move {
        if req.path() == "/boom" {
            panic!("boom requested");
        }
        let visits = context(w.as_mut())
            .and_then(|ctx| ctx.get::<u64>("visits").copied())
            .unwrap_or_default();
        let _ = w.respond(
            http::StatusCode::OK,
            "text/plain; charset=utf-8",
            format!("hello, visit #{visits}\n").as_bytes(),
        );
    }));

    let store = Arc::new(MemoryStore::new());
    let sessions = SessionOptions::new(store, "keyboard cat").cookie(CookieTemplate {
        max_age: 3600,
        ..Default::default()
    });

    let app = ContextHandler::new(count.chain(render), 4);
    let stack = PanicHandler::new(
        LoggingHandler::new(GzipHandler::new(SessionHandler::new(app, sessions)?))
            .format(LogFormat::Short),
    );
    let stack = FaviconHandler::new(stack, "favicon.ico", Duration::from_secs(86_400));

    Server::bind("0.0.0.0:3000").serve(stack).await
}
