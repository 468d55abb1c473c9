//! OCR results per (document, page). Retrying a failed page skips re-extraction.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheKind, ManagedCache};
use crate::ocr::TextRegion;

pub struct OcrCache {
    inner: Mutex<LruCache<(PathBuf, usize), Arc<Vec<TextRegion>>>>,
}

impl OcrCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn get(&self, document: &Path, page: usize) -> Option<Arc<Vec<TextRegion>>> {
        self.inner
            .lock()
            .get(&(document.to_path_buf(), page))
            .cloned()
    }

    pub fn insert(&self, document: &Path, page: usize, regions: Arc<Vec<TextRegion>>) {
        self.inner.lock().put((document.to_path_buf(), page), regions);
    }
}

impl ManagedCache for OcrCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Ocr
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}
