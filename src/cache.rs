//! Write-through identifier cache for dictionary entities (artists, albums, tracks).
//!
//! The store stays authoritative: a miss always goes through the store's atomic
//! get-or-create, and only successful results are cached.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::db::{self, Pool};
use crate::model::DictionaryKind;

/// Get-or-create by natural key, atomic per key.
#[async_trait]
pub trait DictionaryStore: Send + Sync {
    async fn get_or_create(&self, kind: DictionaryKind, name: &str, mbid: Option<&str>)
        -> Result<i64>;
}

#[async_trait]
impl DictionaryStore for Pool {
    async fn get_or_create(
        &self,
        kind: DictionaryKind,
        name: &str,
        mbid: Option<&str>,
    ) -> Result<i64> {
        db::get_or_create_dictionary(self, kind, name, mbid).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: i64,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct IdentifierCache {
    ttl: Duration,
    entries: Mutex<HashMap<(DictionaryKind, String), Entry>>,
}

impl IdentifierCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, kind: DictionaryKind, name: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(kind, name.to_string()))
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.id)
    }

    /// Store id for `name`, creating the dictionary row if needed.
    pub async fn resolve(
        &self,
        store: &dyn DictionaryStore,
        kind: DictionaryKind,
        name: &str,
        mbid: Option<&str>,
    ) -> Result<i64> {
        if let Some(id) = self.lookup(kind, name) {
            return Ok(id);
        }

        let id = store.get_or_create(kind, name, mbid).await?;
        debug!(table = kind.table(), id, "identifier cached");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (kind, name.to_string()),
            Entry {
                id,
                stored_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
