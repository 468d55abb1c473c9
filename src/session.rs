//! Per-reader view state: which manga is open, where the reader is, and
//! which page images to show right now.
//!
//! Originals and translated images are cached for the open document only;
//! opening another document clears both. Pages on screen are awaited, the
//! next few pages are prefetched in the background.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::page_list::PageListCache;
use crate::error::PipelineError;
use crate::factory::TranslationFactory;
use crate::library::LibraryIndexer;
use crate::translate::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Single,
    Double,
}

#[derive(Debug, Clone)]
pub struct PageImage {
    pub page: usize,
    pub image: Bytes,
    /// False when the original is shown (translation off, failed or pending).
    pub translated: bool,
}

#[derive(Debug, Clone)]
pub struct PageImages {
    pub pages: Vec<PageImage>,
    pub prefetching: Vec<usize>,
}

#[derive(Default)]
struct ViewState {
    document: Option<PathBuf>,
    current_page: usize,
    originals: HashMap<usize, Bytes>,
    translated: HashMap<(usize, BackendKind), Bytes>,
}

impl ViewState {
    fn is_showing(&self, document: &Path) -> bool {
        self.document.as_deref() == Some(document)
    }
}

/// Shared with the prefetch task.
struct SessionShared {
    library: Arc<dyn LibraryIndexer>,
    state: Mutex<ViewState>,
}

impl SessionShared {
    async fn original(&self, document: &Path, page: usize) -> Result<Bytes, PipelineError> {
        {
            let state = self.state.lock();
            if state.is_showing(document) {
                if let Some(image) = state.originals.get(&page) {
                    return Ok(image.clone());
                }
            }
        }
        let library = Arc::clone(&self.library);
        let doc = document.to_path_buf();
        let image = tokio::task::spawn_blocking(move || library.load_page(&doc, page)).await??;

        let mut state = self.state.lock();
        // the reader may have moved on while the page loaded
        if state.is_showing(document) {
            state.originals.insert(page, image.clone());
        }
        Ok(image)
    }

    fn cached_translation(&self, document: &Path, page: usize, backend: BackendKind) -> Option<Bytes> {
        let state = self.state.lock();
        if !state.is_showing(document) {
            return None;
        }
        state.translated.get(&(page, backend)).cloned()
    }

    fn store_translation(&self, document: &Path, page: usize, backend: BackendKind, image: Bytes) {
        let mut state = self.state.lock();
        if state.is_showing(document) {
            state.translated.insert((page, backend), image);
        }
    }
}

/// One instance per reading session.
pub struct SessionViewerManager {
    id: Uuid,
    factory: Arc<TranslationFactory>,
    page_list: Arc<PageListCache>,
    backend: BackendKind,
    prefetch_pages: usize,
    shared: Arc<SessionShared>,
}

impl SessionViewerManager {
    pub fn new(
        factory: Arc<TranslationFactory>,
        library: Arc<dyn LibraryIndexer>,
        page_list: Arc<PageListCache>,
        backend: BackendKind,
        prefetch_pages: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            factory,
            page_list,
            backend,
            prefetch_pages,
            shared: Arc::new(SessionShared {
                library,
                state: Mutex::new(ViewState::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn current_document(&self) -> Option<PathBuf> {
        self.shared.state.lock().document.clone()
    }

    /// Cached originals and translations for the open document.
    pub fn cached_counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.originals.len(), state.translated.len())
    }

    /// Open `document` at `page`. A different document clears the session
    /// caches and becomes the pipeline's active document.
    pub fn set_current_manga(&self, document: &Path, page: usize) {
        let switched = {
            let mut state = self.shared.state.lock();
            let switched = !state.is_showing(document);
            if switched {
                state.originals.clear();
                state.translated.clear();
                state.document = Some(document.to_path_buf());
            }
            state.current_page = page;
            switched
        };
        if switched {
            let cancelled = self.factory.set_active_document(document);
            debug!(
                session = %self.id,
                document = %document.display(),
                cancelled = cancelled.len(),
                "session opened document"
            );
        }
        self.factory.set_current_page(document, page);
    }

    pub fn go_to_page(&self, page: usize) -> Result<(), PipelineError> {
        let document = self.current_document().ok_or(PipelineError::NoActiveDocument)?;
        self.shared.state.lock().current_page = page;
        self.factory.set_current_page(&document, page);
        Ok(())
    }

    /// Images to display at `page`, translated when enabled and available.
    pub async fn get_page_images(
        &self,
        page: usize,
        mode: DisplayMode,
        translation_enabled: bool,
    ) -> Result<PageImages, PipelineError> {
        let document = self.current_document().ok_or(PipelineError::NoActiveDocument)?;
        let page_count = self.page_count(&document).await?;
        if page >= page_count {
            return Err(PipelineError::PageOutOfRange {
                document,
                page,
                page_count,
            });
        }
        self.go_to_page(page)?;

        let shown = pages_to_show(page, mode, page_count);
        let after = shown.last().copied().unwrap_or(page);
        let prefetching = pages_to_prefetch(after, self.prefetch_pages, page_count);

        let pages = try_join_all(
            shown
                .iter()
                .map(|&p| self.load_page(&document, p, translation_enabled)),
        )
        .await?;

        if !prefetching.is_empty() {
            self.spawn_prefetch(document, prefetching.clone(), translation_enabled);
        }
        Ok(PageImages { pages, prefetching })
    }

    async fn page_count(&self, document: &Path) -> Result<usize, PipelineError> {
        if let Some(count) = self.page_list.get(document) {
            return Ok(count);
        }
        let library = Arc::clone(&self.shared.library);
        let page_list = Arc::clone(&self.page_list);
        let doc = document.to_path_buf();
        let count = tokio::task::spawn_blocking(move || {
            page_list.get_or_load(&doc, || library.page_count(&doc))
        })
        .await??;
        Ok(count)
    }

    async fn load_page(
        &self,
        document: &Path,
        page: usize,
        translation_enabled: bool,
    ) -> Result<PageImage, PipelineError> {
        let original = self.shared.original(document, page).await?;
        if !translation_enabled {
            return Ok(PageImage {
                page,
                image: original,
                translated: false,
            });
        }
        if let Some(image) = self.shared.cached_translation(document, page, self.backend) {
            return Ok(PageImage {
                page,
                image,
                translated: true,
            });
        }

        match self
            .factory
            .get_translated_page(document, page, self.backend)
            .await
        {
            Ok(Some(image)) => {
                self.shared
                    .store_translation(document, page, self.backend, image.clone());
                Ok(PageImage {
                    page,
                    image,
                    translated: true,
                })
            }
            Ok(None) => {
                debug!(page, "translation unavailable, showing original");
                Ok(PageImage {
                    page,
                    image: original,
                    translated: false,
                })
            }
            Err(e) => {
                warn!(page, error = %e, "translation request failed, showing original");
                Ok(PageImage {
                    page,
                    image: original,
                    translated: false,
                })
            }
        }
    }

    fn spawn_prefetch(&self, document: PathBuf, pages: Vec<usize>, translation_enabled: bool) {
        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let backend = self.backend;
        tokio::spawn(async move {
            for page in pages {
                if !shared.state.lock().is_showing(&document) {
                    return;
                }
                if let Err(e) = shared.original(&document, page).await {
                    debug!(page, error = %e, "prefetch of original failed");
                    continue;
                }
                if translation_enabled {
                    if let Err(e) = factory.prefetch_page(&document, page, backend).await {
                        debug!(page, error = %e, "translation prefetch failed");
                    }
                }
            }
        });
    }
}

/// Pages visible at `page` in `mode`.
pub fn pages_to_show(page: usize, mode: DisplayMode, page_count: usize) -> Vec<usize> {
    match mode {
        DisplayMode::Double if page + 1 < page_count => vec![page, page + 1],
        _ => vec![page],
    }
}

/// Up to `count` pages following `last_shown`.
pub fn pages_to_prefetch(last_shown: usize, count: usize, page_count: usize) -> Vec<usize> {
    (last_shown + 1..page_count).take(count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_mode_shows_two_pages_when_available() {
        assert_eq!(pages_to_show(4, DisplayMode::Single, 10), vec![4]);
        assert_eq!(pages_to_show(4, DisplayMode::Double, 10), vec![4, 5]);
        assert_eq!(pages_to_show(9, DisplayMode::Double, 10), vec![9]);
    }

    #[test]
    fn prefetch_stops_at_last_page() {
        assert_eq!(pages_to_prefetch(5, 2, 10), vec![6, 7]);
        assert_eq!(pages_to_prefetch(8, 2, 10), vec![9]);
        assert!(pages_to_prefetch(9, 2, 10).is_empty());
        assert!(pages_to_prefetch(0, 0, 10).is_empty());
    }

    #[test]
    fn display_mode_uses_lowercase_names() {
        let mode: DisplayMode = serde_json::from_str("\"double\"").unwrap();
        assert_eq!(mode, DisplayMode::Double);
    }
}
