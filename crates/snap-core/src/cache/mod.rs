//! Content-addressed response cache.
//!
//! Maps a request [`fingerprint`] to the completion previously obtained for
//! it. Entries expire after a TTL, checked lazily on read: a stale entry reads
//! as a miss and is overwritten by the next store; only [`ResponseCache::purge_expired`]
//! removes it eagerly.
//!
//! Every operation serializes on one async mutex (disk layer included), so
//! lookups and stores are linearizable per key.
//!
//! # Cache Structure
//!
//! ```text
//! <dir>/{fp[0..2]}/{fp}.json   # CacheEntry (fingerprint, response, stored_at)
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::errors::SnapResult;
use crate::providers::llm::Completion;

mod io;
pub mod key;

pub use key::fingerprint;

/// Default cache TTL (7 days).
pub const DEFAULT_TTL_DAYS: i64 = 7;
/// Longest accepted cache TTL (100 years).
pub const MAX_TTL_DAYS: i64 = 36_500;

/// One stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: Completion,
    pub stored_at: DateTime<Utc>,
}

/// Shared, concurrency-safe response cache. Cloning shares the same store.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    dir: Option<PathBuf>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("dir", &self.dir)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Memory-only cache.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            dir: None,
            ttl,
            clock: Arc::new(SystemClock),
        }
    }

    /// Cache persisted under `dir`, surviving process restarts.
    pub fn with_dir(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::in_memory(ttl)
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        // a ttl past the calendar range never expires
        entry
            .stored_at
            .checked_add_signed(self.ttl)
            .is_some_and(|expires| expires <= now)
    }

    /// Fetch the response for `fingerprint`; `None` when absent or stale.
    pub async fn lookup(&self, fingerprint: &str) -> SnapResult<Option<Completion>> {
        let mut entries = self.entries.lock().await;

        if !entries.contains_key(fingerprint) {
            if let Some(dir) = &self.dir {
                if let Some(entry) = io::read_entry(&io::entry_path(dir, fingerprint)).await? {
                    entries.insert(fingerprint.to_string(), entry);
                }
            }
        }

        let Some(entry) = entries.get(fingerprint) else {
            debug!(fingerprint, "cache miss");
            return Ok(None);
        };

        if self.is_expired(entry, self.clock.now()) {
            debug!(fingerprint, stored_at = %entry.stored_at, "cache entry expired");
            return Ok(None);
        }

        debug!(fingerprint, "cache hit");
        Ok(Some(entry.response.clone()))
    }

    /// Store `response` under `fingerprint`, replacing any previous entry.
    pub async fn store(&self, fingerprint: &str, response: &Completion) -> SnapResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            response: response.clone(),
            stored_at: self.clock.now(),
        };

        if let Some(dir) = &self.dir {
            let json = serde_json::to_string(&entry).map_err(|e| {
                crate::errors::SnapError::cache(format!("failed to serialize entry: {}", e))
            })?;
            io::write_atomic(&io::entry_path(dir, fingerprint), &json).await?;
        }

        entries.insert(fingerprint.to_string(), entry);
        debug!(fingerprint, "cached response");
        Ok(())
    }

    /// Remove every expired entry; returns how many were removed.
    pub async fn purge_expired(&self) -> SnapResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();

        let mut removed: HashSet<String> = entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.fingerprint.clone())
            .collect();
        entries.retain(|fp, _| !removed.contains(fp));

        if let Some(dir) = &self.dir {
            for path in io::list_entries(dir).await? {
                let Some(entry) = io::read_entry(&path).await? else {
                    continue;
                };
                if self.is_expired(&entry, now) {
                    io::remove_entry(&path).await?;
                    removed.insert(entry.fingerprint);
                }
            }
        }

        debug!(removed = removed.len(), "purged expired cache entries");
        Ok(removed.len())
    }

    /// Remove every entry; returns how many were removed.
    pub async fn clear(&self) -> SnapResult<usize> {
        let mut entries = self.entries.lock().await;
        let mut removed: HashSet<String> = entries.drain().map(|(fp, _)| fp).collect();

        if let Some(dir) = &self.dir {
            for path in io::list_entries(dir).await? {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    removed.insert(stem.to_string());
                }
                io::remove_entry(&path).await?;
            }
        }
        Ok(removed.len())
    }

    /// Entries currently held in memory (including stale ones).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
