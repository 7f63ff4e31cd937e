//! Redis-backed session store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::{Session, SessionStore};
use crate::error::{Error, StoreError};

/// Keys visited per `SCAN` round trip.
const SCAN_BATCH: usize = 100;

/// Keeps sessions in Redis as JSON strings under `<prefix>:<id>`.
///
/// `set` applies the session's max-age as the key's expiry, so Redis drops
/// idle sessions on its own. `clear` and `count` only touch keys under the
/// prefix, which lets several applications share one database.
///
/// The connection is a [`ConnectionManager`]: cheap to clone per call and
/// reconnecting on its own after failures.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1/0`) and checks the server
    /// answers.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        let store = Self::new(conn, prefix)?;
        store.ping().await?;
        Ok(store)
    }

    /// Wraps an existing connection.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StoreError::NoKeyPrefix);
        }
        Ok(Self { conn, prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    fn key(&self, id: &str) -> String {
        session_key(&self.prefix, id)
    }

    /// Every key under the prefix, collected with `SCAN` so the server is
    /// never blocked the way `KEYS` would.
    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = scan_pattern(&self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, id: &str, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(id)).arg(json);
        // Redis rejects `EX 0`; a zero max-age means no expiry.
        let secs = session.max_age().as_secs();
        if secs > 0 {
            cmd.arg("EX").arg(secs);
        }
        let mut conn = self.conn.clone();
        let _: () = cmd.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(self.key(id)).query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let keys = self.keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for chunk in keys.chunks(SCAN_BATCH) {
            pipe.cmd("DEL").arg(chunk).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn count(&self) -> usize {
        match self.keys().await {
            Ok(keys) => keys.len(),
            Err(e) => {
                warn!(prefix = %self.prefix, "counting sessions failed: {e}");
                0
            }
        }
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn session_key(prefix: &str, id: &str) -> String {
    format!("{prefix}:{id}")
}

/// `SCAN MATCH` pattern for every key under `prefix`, with glob
/// metacharacters in the prefix escaped.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(":*");
    pattern
}
