//! Cache domains and the registry that owns them.
//!
//! Each domain is instantiated at most once per `CacheManagerFactory`; the
//! factory also owns teardown. Domains:
//! - `page_list`: document → page count (memory)
//! - `ocr`: (document, page) → text regions (memory)
//! - `translation_text`: text fingerprint → translation (memory L1 + SQLite L2)
//! - `page_image`: (document, page, language, backend) → translated image (disk)

pub mod ocr;
pub mod page_image;
pub mod page_list;
pub mod sqlite;
pub mod text;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;
use ocr::OcrCache;
use page_image::PersistentPageCache;
use page_list::PageListCache;
use text::TextCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown cache type: {0}")]
    UnknownCacheType(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache {0} is closed")]
    Closed(CacheKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    PageList,
    Ocr,
    TranslationText,
    PageImage,
}

impl CacheKind {
    pub const ALL: [CacheKind; 4] = [
        CacheKind::PageList,
        CacheKind::Ocr,
        CacheKind::TranslationText,
        CacheKind::PageImage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::PageList => "page_list",
            CacheKind::Ocr => "ocr",
            CacheKind::TranslationText => "translation_text",
            CacheKind::PageImage => "page_image",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CacheError::UnknownCacheType(s.to_string()))
    }
}

/// Uniform lifecycle surface shared by every cache domain.
pub trait ManagedCache: Send + Sync {
    fn kind(&self) -> CacheKind;
    fn len(&self) -> usize;
    fn clear(&self);
    /// Release resources. Default: nothing to release.
    fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live cache manager, typed by domain.
#[derive(Clone)]
pub enum CacheHandle {
    PageList(Arc<PageListCache>),
    Ocr(Arc<OcrCache>),
    TranslationText(Arc<TextCache>),
    PageImage(Arc<PersistentPageCache>),
}

impl CacheHandle {
    pub fn as_managed(&self) -> &dyn ManagedCache {
        match self {
            CacheHandle::PageList(c) => c.as_ref(),
            CacheHandle::Ocr(c) => c.as_ref(),
            CacheHandle::TranslationText(c) => c.as_ref(),
            CacheHandle::PageImage(c) => c.as_ref(),
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.as_managed().kind()
    }
}

/// Registry producing one manager per cache domain.
pub struct CacheManagerFactory {
    settings: CacheSettings,
    root: PathBuf,
    managers: Mutex<HashMap<CacheKind, CacheHandle>>,
}

impl CacheManagerFactory {
    /// `root` holds the on-disk caches: `translations.sqlite3` and `pages/`.
    pub fn new(settings: CacheSettings, root: PathBuf) -> Self {
        Self {
            settings,
            root,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a manager by type name. Unknown names are a programmer error.
    pub fn get_manager(&self, cache_type: &str) -> Result<CacheHandle, CacheError> {
        let kind: CacheKind = cache_type.parse()?;
        self.get(kind)
    }

    pub fn get(&self, kind: CacheKind) -> Result<CacheHandle, CacheError> {
        let mut managers = self.managers.lock();
        if let Some(handle) = managers.get(&kind) {
            return Ok(handle.clone());
        }
        let handle = self.create(kind)?;
        managers.insert(kind, handle.clone());
        debug!(cache = %kind, "cache manager created");
        Ok(handle)
    }

    fn create(&self, kind: CacheKind) -> Result<CacheHandle, CacheError> {
        Ok(match kind {
            CacheKind::PageList => {
                CacheHandle::PageList(Arc::new(PageListCache::new(self.settings.page_list_capacity)))
            }
            CacheKind::Ocr => CacheHandle::Ocr(Arc::new(OcrCache::new(self.settings.ocr_capacity))),
            CacheKind::TranslationText => {
                let cache = TextCache::open(
                    &self.root.join("translations.sqlite3"),
                    self.settings.text_memory_capacity,
                )?;
                CacheHandle::TranslationText(Arc::new(cache))
            }
            CacheKind::PageImage => CacheHandle::PageImage(Arc::new(PersistentPageCache::open(
                self.root.join("pages"),
            )?)),
        })
    }

    pub fn page_list_cache(&self) -> Result<Arc<PageListCache>, CacheError> {
        match self.get(CacheKind::PageList)? {
            CacheHandle::PageList(c) => Ok(c),
            other => Err(CacheError::UnknownCacheType(other.kind().to_string())),
        }
    }

    pub fn ocr_cache(&self) -> Result<Arc<OcrCache>, CacheError> {
        match self.get(CacheKind::Ocr)? {
            CacheHandle::Ocr(c) => Ok(c),
            other => Err(CacheError::UnknownCacheType(other.kind().to_string())),
        }
    }

    pub fn text_cache(&self) -> Result<Arc<TextCache>, CacheError> {
        match self.get(CacheKind::TranslationText)? {
            CacheHandle::TranslationText(c) => Ok(c),
            other => Err(CacheError::UnknownCacheType(other.kind().to_string())),
        }
    }

    pub fn page_image_cache(&self) -> Result<Arc<PersistentPageCache>, CacheError> {
        match self.get(CacheKind::PageImage)? {
            CacheHandle::PageImage(c) => Ok(c),
            other => Err(CacheError::UnknownCacheType(other.kind().to_string())),
        }
    }

    /// Kinds with a live manager, in a stable order.
    pub fn live_managers(&self) -> Vec<CacheKind> {
        let mut kinds: Vec<CacheKind> = self.managers.lock().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Close every live manager. A failing close is logged and does not stop
    /// the rest. Returns the number closed cleanly.
    pub fn close_all_managers(&self) -> usize {
        let drained: Vec<CacheHandle> = {
            let mut managers = self.managers.lock();
            let mut handles: Vec<(CacheKind, CacheHandle)> = managers.drain().collect();
            handles.sort_by_key(|(kind, _)| *kind);
            handles.into_iter().map(|(_, h)| h).collect()
        };
        let closed = close_managers(drained.iter().map(CacheHandle::as_managed));
        info!(closed, total = drained.len(), "cache managers closed");
        closed
    }
}

/// Close each cache in turn, counting clean closes.
fn close_managers<'a>(caches: impl IntoIterator<Item = &'a dyn ManagedCache>) -> usize {
    let mut closed = 0;
    for cache in caches {
        match cache.close() {
            Ok(()) => closed += 1,
            Err(e) => warn!(cache = %cache.kind(), error = %e, "cache close failed"),
        }
    }
    closed
}
