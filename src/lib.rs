//! # strata
//!
//! Composable HTTP middleware for Rust services: gzip compression, access
//! logging, panic recovery, per-request context, and signed-cookie sessions,
//! each a [`Handler`] wrapping another handler.
//!
//! ## How it fits together
//!
//! - A [`Handler`] reads a [`Request`] and writes into a response channel, a
//!   [`BoxWriter`].
//! - A stage wraps the channel in its own decorator before calling the next
//!   handler, so it sees the status, headers and body on their way out.
//! - Inner handlers find outer state (the session, the context, a caught
//!   panic) by walking the decorator chain with [`writer::lookup`]. There is
//!   no global registry and nothing is shared between requests.
//! - Applying a stage twice is the same as applying it once.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata::middleware::{
//!     GzipHandler, LoggingHandler, PanicHandler, SessionHandler, SessionOptions, session,
//! };
//! use strata::session::MemoryStore;
//! use strata::{Server, WriterExt, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), strata::Error> {
//!     let app = handler_fn(|_req, w| Box::pin(async move {
//!         let visits = match session(w.as_mut()) {
//!             Some(s) => {
//!                 let n = s.get::<u64>("visits").unwrap_or(0) + 1;
//!                 let _ = s.insert("visits", n);
//!                 n
//!             }
//!             None => 0,
//!         };
//!         let _ = w.write_str(&format!("visit #{visits}\n"));
//!     }));
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let stack = PanicHandler::new(LoggingHandler::new(GzipHandler::new(
//!         SessionHandler::new(app, SessionOptions::new(store, "change me"))?,
//!     )));
//!
//!     Server::bind("0.0.0.0:3000").serve(stack).await
//! }
//! ```

mod error;
mod handler;
mod request;
mod server;

pub mod middleware;
pub mod session;
pub mod writer;

pub use error::{Error, StoreError};
pub use handler::{BoxFuture, BoxedHandler, Chain, Handler, HandlerExt, HandlerFn, handler_fn, respond};
pub use request::Request;
pub use server::Server;
pub use writer::{BoxWriter, ResponseBuffer, ResponseWriter, WriterExt};
