//! Unified error types.

/// The error type returned by strata's fallible operations.
///
/// Per-request conditions (a missing cookie, a store miss) are never
/// surfaced as `Error`s; they are logged and papered over inside the stage.
/// This type covers setup-time misconfiguration and server infrastructure
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding to a port or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A session stage was configured without a signing secret.
    #[error("session secret is missing")]
    MissingSecret,

    /// A session store could not be set up, e.g. its server is unreachable.
    #[error("session store: {0}")]
    Store(#[from] StoreError),
}

/// Failure reported by a [`SessionStore`](crate::session::SessionStore)
/// backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("backend: {0}")]
    Backend(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A shared backend needs a key prefix to scope `clear` and `count`.
    #[error("store needs a non-empty key prefix")]
    NoKeyPrefix,
}
