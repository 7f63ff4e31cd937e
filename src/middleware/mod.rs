//! Request-processing stages.
//!
//! Each stage is a [`Handler`](crate::Handler) wrapping another handler, so
//! stages compose by nesting and can be stacked in any order. A stage applied
//! twice around the same handler notices the outer copy and passes straight
//! through.
//!
//! | Stage              | Decorator        | Inner handlers reach it through |
//! |--------------------|------------------|---------------------------------|
//! | [`PanicHandler`]   | [`PanicWriter`]  | [`panic_payload`]               |
//! | [`LoggingHandler`] | [`StatusWriter`] | -                               |
//! | [`GzipHandler`]    | [`GzipWriter`]   | -                               |
//! | [`SessionHandler`] | [`SessionWriter`]| [`session`], [`session_store`]  |
//! | [`ContextHandler`] | [`ContextWriter`]| [`context`]                     |
//! | [`FaviconHandler`] | none             | -                               |
//!
//! A typical stack, outermost first:
//!
//! ```text
//! Panic → Logging → Gzip → Session → Context → app
//! ```

pub mod context;
pub mod favicon;
pub mod gzip;
pub mod logging;
pub mod panic;
pub mod session;

pub use context::{Context, ContextHandler, ContextWriter, context};
pub use favicon::FaviconHandler;
pub use gzip::{ContentTypeFilter, GzipHandler, GzipWriter, accepts_gzip, default_filter};
pub use logging::{LogFormat, LogSink, LoggingHandler, StatusWriter};
pub use panic::{PanicHandler, PanicPayload, PanicWriter, panic_payload};
pub use session::{
    CookieTemplate, DEFAULT_COOKIE_NAME, SessionHandler, SessionOptions, SessionWriter, session,
    session_store,
};
