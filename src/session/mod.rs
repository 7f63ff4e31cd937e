//! Sessions and the stores that persist them.
//!
//! A [`Session`] is a bag of JSON values behind an unguessable identifier.
//! The [`SessionHandler`](crate::middleware::SessionHandler) stage resolves
//! it from the signed session cookie, hands it to inner handlers, and saves it
//! back to a [`SessionStore`] when the request ends.

mod memory;
mod remote;
pub(crate) mod signing;

pub use memory::MemoryStore;
pub use remote::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

// ── Session ───────────────────────────────────────────────────────────────────

/// Per-visitor state that outlives a single request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    id: String,
    data: HashMap<String, Value>,
    max_age: Duration,
    original_max_age: Duration,
}

impl Session {
    /// A fresh, empty session with a random v4 UUID as its identifier.
    ///
    /// `max_age` is the time-to-live stores are asked to apply; zero means no
    /// expiry.
    pub fn new(max_age: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data: HashMap::new(),
            max_age,
            original_max_age: max_age,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current time-to-live.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn original_max_age(&self) -> Duration {
        self.original_max_age
    }

    /// Sliding expiration: back to the configured time-to-live.
    pub(crate) fn reset_max_age(&mut self) {
        self.max_age = self.original_max_age;
    }

    /// Deserializes the value under `key`. `None` when absent or of another
    /// shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.data.get(key)?.clone()).ok()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Serializes `value` under `key`, returning the previous value.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<Option<Value>, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.data.insert(key.into(), value))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── Store contract ────────────────────────────────────────────────────────────

/// Persistence backend for sessions.
///
/// Implementations are shared by every in-flight request and must do their
/// own synchronisation. Network round trips belong in the returned futures:
/// a store must never block the worker thread it is polled on.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when no (unexpired) session has this identifier.
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Saves `session`, using [`Session::max_age`] as the expiry hint where
    /// the backend supports one.
    async fn set(&self, id: &str, session: &Session) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Removes every session in this store's namespace.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Number of live sessions. Backend failures are logged and count as
    /// zero.
    async fn count(&self) -> usize;
}
