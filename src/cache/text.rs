//! Translation text cache: in-memory LRU (L1) over a SQLite store (L2).
//! Key: blake3 fingerprint of (normalized text | target language | backend id).

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

use super::sqlite::SqliteTextStore;
use super::{CacheError, CacheKind, ManagedCache};
use crate::translate::normalize::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEntry {
    pub translated_text: String,
    /// Produced by the fallback after the primary refused the text. Such
    /// entries are revalidated on every hit.
    pub is_sensitive: bool,
    pub original_text: String,
}

pub struct TextCache {
    memory: Mutex<LruCache<Fingerprint, TextEntry>>,
    persistent: Option<SqliteTextStore>,
    closed: AtomicBool,
}

impl TextCache {
    #[cfg(test)]
    pub fn in_memory(capacity: usize) -> Self {
        Self::with_store(capacity, None)
    }

    /// Memory cache backed by the SQLite file at `db_path`.
    pub fn open(db_path: &Path, capacity: usize) -> Result<Self, CacheError> {
        Ok(Self::with_store(capacity, Some(SqliteTextStore::open(db_path)?)))
    }

    pub fn with_store(capacity: usize, persistent: Option<SqliteTextStore>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            persistent,
            closed: AtomicBool::new(false),
        }
    }

    /// L1 first, then L2 (promoting hits into L1).
    pub fn get(&self, key: &Fingerprint) -> Option<TextEntry> {
        if let Some(entry) = self.memory.lock().get(key) {
            return Some(entry.clone());
        }
        let store = self.store()?;
        match store.get(key) {
            Ok(Some(entry)) => {
                self.memory.lock().put(*key, entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "L2 text cache read failed");
                None
            }
        }
    }

    /// Insert or overwrite in both levels. L2 write failures are logged; the
    /// entry still serves from memory.
    pub fn put(&self, key: Fingerprint, entry: TextEntry) {
        if let Some(store) = self.store() {
            if let Err(e) = store.upsert(&key, &entry) {
                warn!(error = %e, "L2 text cache write failed");
            }
        }
        self.memory.lock().put(key, entry);
    }

    fn store(&self) -> Option<&SqliteTextStore> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.persistent.as_ref()
    }
}

impl ManagedCache for TextCache {
    fn kind(&self) -> CacheKind {
        CacheKind::TranslationText
    }

    fn len(&self) -> usize {
        match self.store().map(|s| s.count()) {
            Some(Ok(n)) => n,
            _ => self.memory.lock().len(),
        }
    }

    fn clear(&self) {
        self.memory.lock().clear();
        if let Some(store) = self.store() {
            if let Err(e) = store.clear() {
                warn!(error = %e, "L2 text cache clear failed");
            }
        }
    }

    /// Checkpoints the SQLite WAL and detaches L2; memory entries stay readable.
    fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.persistent {
            Some(store) => store.checkpoint(),
            None => Ok(()),
        }
    }
}
