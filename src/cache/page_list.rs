//! Document → page count, fed by the library indexer.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheKind, ManagedCache};
use crate::library::LibraryError;

pub struct PageListCache {
    inner: Mutex<LruCache<PathBuf, usize>>,
}

impl PageListCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn get(&self, document: &Path) -> Option<usize> {
        self.inner.lock().get(document).copied()
    }

    pub fn insert(&self, document: &Path, page_count: usize) {
        self.inner.lock().put(document.to_path_buf(), page_count);
    }

    /// Cached count, or `load` on a miss. The lock is not held while loading.
    pub fn get_or_load(
        &self,
        document: &Path,
        load: impl FnOnce() -> Result<usize, LibraryError>,
    ) -> Result<usize, LibraryError> {
        if let Some(count) = self.get(document) {
            return Ok(count);
        }
        let count = load()?;
        self.insert(document, count);
        Ok(count)
    }
}

impl ManagedCache for PageListCache {
    fn kind(&self) -> CacheKind {
        CacheKind::PageList
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}
