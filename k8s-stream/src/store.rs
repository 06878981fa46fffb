//! Volatile key/value store backing the pipeline's dedup markers, object cache and reverse index.
//!
//! Records live under the composite key `table-id`. Every table gets a secondary index the first
//! time it is written to, which is what `list_by_prefix` walks. All mutations go through a single
//! writer lock, readers share it.
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store lock was poisoned by a panicking writer")]
    Poisoned,
    #[error("failed to encode record {key}: {error}")]
    Encode {
        key: String,
        error: serde_json::Error,
    },
    #[error("failed to decode record {key}: {error}")]
    Decode {
        key: String,
        error: serde_json::Error,
    },
}

/// A record as returned by a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub table: String,
    pub id: String,
    pub payload: Vec<u8>,
    pub expires_at: Option<Instant>,
}

pub fn make_key(table: &str, id: &str) -> String {
    format!("{table}-{id}")
}

/// Storage capability used by every pipeline component.
pub trait LocalStore: Send + Sync {
    /// Point lookup. `Ok(None)` means the key is absent or expired.
    fn get(&self, table: &str, id: &str) -> Result<Option<CacheRecord>, StoreError>;

    /// Unconditional upsert without expiration.
    fn set(&self, table: &str, id: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Upsert that expires after `ttl_seconds`. Non-positive values behave like `set`.
    fn set_with_ttl(
        &self,
        table: &str,
        id: &str,
        value: Vec<u8>,
        ttl_seconds: i64,
    ) -> Result<(), StoreError>;

    /// Ids of all live records in `table` starting with `id_prefix`, in ascending order.
    fn list_by_prefix(&self, table: &str, id_prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Drop expired records, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// JSON helpers on top of the raw byte contract.
pub trait StoreExt: LocalStore {
    fn get_json<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(table, id)? {
            Some(record) => serde_json::from_slice(&record.payload)
                .map(Some)
                .map_err(|error| StoreError::Decode {
                    key: make_key(table, id),
                    error,
                }),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(
        &self,
        table: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.set_json_with_ttl(table, id, value, 0)
    }

    fn set_json_with_ttl<T: Serialize + ?Sized>(
        &self,
        table: &str,
        id: &str,
        value: &T,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(value).map_err(|error| StoreError::Encode {
            key: make_key(table, id),
            error,
        })?;
        self.set_with_ttl(table, id, payload, ttl_seconds)
    }
}

impl<S: LocalStore + ?Sized> StoreExt for S {}

#[derive(Debug, Clone)]
struct Entry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// table name -> ids written to it
    indexes: HashMap<String, BTreeSet<String>>,
}

/// In-memory `LocalStore` guarded by a reader/writer lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the tables that currently have an index.
    pub fn tables(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut tables: Vec<String> = inner.indexes.keys().cloned().collect();
        tables.sort();
        Ok(tables)
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, table: &str, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();

        Ok(inner
            .entries
            .get(&make_key(table, id))
            .filter(|entry| entry.is_live(now))
            .map(|entry| CacheRecord {
                table: table.to_owned(),
                id: id.to_owned(),
                payload: entry.payload.clone(),
                expires_at: entry.expires_at,
            }))
    }

    fn set(&self, table: &str, id: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.set_with_ttl(table, id, value, 0)
    }

    fn set_with_ttl(
        &self,
        table: &str,
        id: &str,
        value: Vec<u8>,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        // A deadline past what `Instant` can represent never expires.
        let expires_at = (ttl_seconds > 0)
            .then(|| Instant::now().checked_add(Duration::from_secs(ttl_seconds.unsigned_abs())))
            .flatten();

        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;

        // Index registration shares the write transaction with the insert.
        if !inner.indexes.contains_key(table) {
            tracing::debug!(table, "registering store index");
            inner.indexes.insert(table.to_owned(), BTreeSet::new());
        }
        if let Some(index) = inner.indexes.get_mut(table) {
            index.insert(id.to_owned());
        }

        inner.entries.insert(
            make_key(table, id),
            Entry {
                payload: value,
                expires_at,
            },
        );
        Ok(())
    }

    fn list_by_prefix(&self, table: &str, id_prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let Some(index) = inner.indexes.get(table) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();

        Ok(index
            .range(id_prefix.to_owned()..)
            .take_while(|id| id.starts_with(id_prefix))
            .filter(|id| {
                inner
                    .entries
                    .get(&make_key(table, id))
                    .is_some_and(|entry| entry.is_live(now))
            })
            .cloned()
            .collect())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();
        let Inner { entries, indexes } = &mut *inner;

        let mut removed = 0;
        for (table, ids) in indexes.iter_mut() {
            ids.retain(|id| {
                let key = make_key(table, id);
                match entries.get(&key) {
                    Some(entry) if !entry.is_live(now) => {
                        entries.remove(&key);
                        removed += 1;
                        false
                    }
                    _ => true,
                }
            });
        }
        Ok(removed)
    }
}
