//! In-process session store.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Session, SessionStore};
use crate::error::StoreError;

struct Entry {
    json: String,
    expires: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    /// Earliest expiry in `map`. Once it has passed, the next write sweeps.
    next_expiry: Option<Instant>,
}

impl Entries {
    fn sweep(&mut self, now: Instant) {
        self.map.retain(|_, e| !e.expired(now));
        self.next_expiry = self.map.values().filter_map(|e| e.expires).min();
    }

    fn sweep_due(&self, now: Instant) -> bool {
        self.next_expiry.is_some_and(|at| at <= now)
    }
}

/// Keeps sessions in a map guarded by a read/write lock.
///
/// Sessions are stored serialized, so a handler mutating its copy changes
/// nothing until the session stage saves it. A non-zero
/// [`Session::max_age`] makes the entry expire that long after the last
/// `set`. Expired entries are invisible right away and dropped by the next
/// write, so sessions whose clients never return do not pile up.
///
/// Everything is lost when the process exits.
pub struct MemoryStore {
    entries: RwLock<Entries>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-sizes the map, including after [`clear`](SessionStore::clear).
    pub fn with_capacity(capacity: usize) -> Self {
        let entries = Entries { map: HashMap::with_capacity(capacity), next_expiry: None };
        Self { entries: RwLock::new(entries), capacity }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.map.get(id) {
            Some(entry) if !entry.expired(now) => Ok(Some(serde_json::from_str(&entry.json)?)),
            _ => Ok(None),
        }
    }

    async fn set(&self, id: &str, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let ttl = session.max_age();
        let now = Instant::now();
        let expires = (!ttl.is_zero()).then(|| now + ttl);

        let mut entries = self.entries.write();
        if entries.sweep_due(now) {
            entries.sweep(now);
        }
        entries.map.insert(id.to_owned(), Entry { json, expires });
        if let Some(at) = expires {
            entries.next_expiry = Some(entries.next_expiry.map_or(at, |next| next.min(at)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.entries.write().map.remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        entries.map = HashMap::with_capacity(self.capacity);
        entries.next_expiry = None;
        Ok(())
    }

    async fn count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.sweep_due(now) {
            entries.sweep(now);
        }
        entries.map.len()
    }
}
