//! Translation factory: the blocking "give me this page translated" surface.
//!
//! Callers get a finished image, `None` (failed, cancelled, timed out), or a
//! fail-fast error for an unconfigured backend. Overlapping requests for one
//! page share a single translation: only the request that claims the page
//! enqueues it, everyone waits on the page's status channel.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::page_image::{PageImageKey, PersistentPageCache};
use crate::cancellation::ActiveDocument;
use crate::error::PipelineError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::scheduler::{EnqueueOutcome, TranslationQueue};
use crate::state_machine::{PageKey, PageStatus, StatusTable};
use crate::translate::BackendKind;

pub struct TranslationFactory {
    queue: Arc<TranslationQueue>,
    status: Arc<StatusTable>,
    active: Arc<ActiveDocument>,
    page_cache: Arc<PersistentPageCache>,
    backends: HashSet<BackendKind>,
    target_language: String,
    wait_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl TranslationFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TranslationQueue>,
        status: Arc<StatusTable>,
        active: Arc<ActiveDocument>,
        page_cache: Arc<PersistentPageCache>,
        backends: impl IntoIterator<Item = BackendKind>,
        target_language: impl Into<String>,
        wait_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            queue,
            status,
            active,
            page_cache,
            backends: backends.into_iter().collect(),
            target_language: target_language.into(),
            wait_timeout,
            metrics,
        }
    }

    /// Translated image for `page`, waiting for the worker if necessary.
    pub async fn get_translated_page(
        &self,
        document: &Path,
        page: usize,
        backend: BackendKind,
    ) -> Result<Option<Bytes>, PipelineError> {
        self.ensure_backend(backend)?;
        let key = PageKey::new(document, page, backend);
        let image_key = self.image_key(document, page, backend);

        if let Some(image) = self.cached_image(&key, &image_key).await {
            return Ok(Some(image));
        }

        let mut rx = self.status.subscribe(&key);
        let current = self.status.get(&key);
        if !current.is_pending() {
            if current == PageStatus::Translated {
                // finished between the cache lookup and the status read
                if let Some(image) = self.page_cache.get(&image_key).await {
                    return Ok(Some(image));
                }
                debug!(page, "translated page missing from disk, translating again");
                self.status.remove(&key);
                rx = self.status.subscribe(&key);
            }
            if self.active.document().is_none() {
                self.queue.switch_document(document);
            }
            let priority = self.priority_for(document, page);
            match self
                .queue
                .enqueue(document, page, backend, &self.target_language, priority, true)
            {
                EnqueueOutcome::Inactive => {
                    debug!(document = %document.display(), page, "page requested for inactive document");
                    return Ok(None);
                }
                EnqueueOutcome::AlreadyTranslated => {
                    return Ok(self.page_cache.get(&image_key).await);
                }
                EnqueueOutcome::Queued | EnqueueOutcome::AlreadyPending | EnqueueOutcome::Failed => {}
            }
        }

        Ok(self.wait_for(&key, &image_key, rx).await)
    }

    /// Queue `page` without waiting. Failed pages are left alone.
    pub async fn prefetch_page(
        &self,
        document: &Path,
        page: usize,
        backend: BackendKind,
    ) -> Result<EnqueueOutcome, PipelineError> {
        self.ensure_backend(backend)?;
        let key = PageKey::new(document, page, backend);
        let image_key = self.image_key(document, page, backend);
        if self.cached_image(&key, &image_key).await.is_some() {
            return Ok(EnqueueOutcome::AlreadyTranslated);
        }
        let priority = self.priority_for(document, page);
        Ok(self
            .queue
            .enqueue(document, page, backend, &self.target_language, priority, false))
    }

    pub fn status(&self, document: &Path, page: usize, backend: BackendKind) -> PageStatus {
        self.status.get(&PageKey::new(document, page, backend))
    }

    pub fn error_message(&self, document: &Path, page: usize, backend: BackendKind) -> Option<String> {
        self.status.error_message(&PageKey::new(document, page, backend))
    }

    /// Forget a page's translation. A pending page keeps its status.
    pub async fn invalidate(
        &self,
        document: &Path,
        page: usize,
        backend: BackendKind,
    ) -> Result<bool, PipelineError> {
        let key = PageKey::new(document, page, backend);
        let removed = self
            .page_cache
            .remove(&self.image_key(document, page, backend))
            .await?;
        if !self.status.get(&key).is_pending() {
            self.status.remove(&key);
        }
        Ok(removed)
    }

    /// Switch the active document. Returns the pages that were cancelled.
    pub fn set_active_document(&self, document: &Path) -> Vec<PageKey> {
        self.queue.switch_document(document)
    }

    pub fn set_current_page(&self, document: &Path, page: usize) -> usize {
        self.queue.set_current_page(document, page)
    }

    pub fn active_document(&self) -> Option<PathBuf> {
        self.active.document()
    }

    pub fn status_snapshot(&self, document: &Path) -> Vec<(PageKey, PageStatus)> {
        self.status.snapshot(document)
    }

    fn ensure_backend(&self, backend: BackendKind) -> Result<(), PipelineError> {
        if self.backends.contains(&backend) {
            Ok(())
        } else {
            Err(PipelineError::UnknownBackend(backend.to_string()))
        }
    }

    /// Distance from the reader's page; the page number itself before the
    /// reader has moved.
    fn priority_for(&self, document: &Path, page: usize) -> u64 {
        self.active
            .current_page(document)
            .map(|current| current.abs_diff(page) as u64)
            .unwrap_or(page as u64)
    }

    fn image_key(&self, document: &Path, page: usize, backend: BackendKind) -> PageImageKey {
        PageImageKey::new(document, page, self.target_language.as_str(), backend)
    }

    async fn cached_image(&self, key: &PageKey, image_key: &PageImageKey) -> Option<Bytes> {
        let image = self.page_cache.get(image_key).await?;
        self.metrics.incr(metric_names::PAGE_CACHE_HIT);
        // a queued or running translation of the same page keeps its own status
        self.status.mark_cached(key);
        Some(image)
    }

    async fn wait_for(
        &self,
        key: &PageKey,
        image_key: &PageImageKey,
        mut rx: watch::Receiver<PageStatus>,
    ) -> Option<Bytes> {
        let span = self.metrics.span(metric_names::FACTORY_WAIT);
        let status = {
            let waited =
                tokio::time::timeout(self.wait_timeout, rx.wait_for(|s| s.is_terminal())).await;
            match waited {
                Ok(Ok(status)) => *status,
                Ok(Err(_)) => {
                    debug!(page = key.page, "page status dropped while waiting");
                    return None;
                }
                Err(_) => {
                    info!(
                        page = key.page,
                        timeout_ms = self.wait_timeout.as_millis() as u64,
                        "timed out waiting for translation"
                    );
                    return None;
                }
            }
        };
        span.finish();

        match status {
            PageStatus::Translated => {
                let image = self.page_cache.get(image_key).await;
                if image.is_none() {
                    warn!(page = key.page, "page marked translated but missing from cache");
                }
                image
            }
            PageStatus::Failed => {
                debug!(
                    page = key.page,
                    error = ?self.status.error_message(key),
                    "translation failed"
                );
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "/m/a.cbz";

    struct Fixture {
        factory: TranslationFactory,
        queue: Arc<TranslationQueue>,
        status: Arc<StatusTable>,
        active: Arc<ActiveDocument>,
        page_cache: Arc<PersistentPageCache>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(StatusTable::new());
        let active = Arc::new(ActiveDocument::new());
        let queue = Arc::new(TranslationQueue::new(Arc::clone(&status), Arc::clone(&active)));
        let page_cache = Arc::new(PersistentPageCache::open(dir.path().join("pages")).unwrap());
        let factory = TranslationFactory::new(
            Arc::clone(&queue),
            Arc::clone(&status),
            Arc::clone(&active),
            Arc::clone(&page_cache),
            [BackendKind::Zhipu],
            "zh",
            Duration::from_millis(50),
            Arc::new(MetricsRegistry::new()),
        );
        Fixture {
            factory,
            queue,
            status,
            active,
            page_cache,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn cached_page_does_not_finish_a_running_translation() {
        let f = fixture();
        let doc = Path::new(DOC);
        f.factory.set_active_document(doc);
        assert_eq!(
            f.factory.prefetch_page(doc, 2, BackendKind::Zhipu).await.unwrap(),
            EnqueueOutcome::Queued
        );
        let key = PageKey::new(doc, 2, BackendKind::Zhipu);
        f.status.transition(&key, PageStatus::Translating).unwrap();

        let image_key = PageImageKey::new(doc, 2, "zh", BackendKind::Zhipu);
        f.page_cache.put(&image_key, b"older render").await.unwrap();

        let image = f.factory.get_translated_page(doc, 2, BackendKind::Zhipu).await.unwrap();
        assert_eq!(image, Some(Bytes::from_static(b"older render")));
        assert_eq!(f.status.get(&key), PageStatus::Translating);
        // the worker can still report its own result
        f.status.transition(&key, PageStatus::Translated).unwrap();
    }

    #[tokio::test]
    async fn requests_are_prioritized_by_distance_from_the_reader() {
        let f = fixture();
        let doc = Path::new(DOC);
        f.factory.set_active_document(doc);
        f.factory.set_current_page(doc, 4);
        for page in [0, 9, 5, 3] {
            f.factory.prefetch_page(doc, page, BackendKind::Zhipu).await.unwrap();
        }
        assert_eq!(f.active.current_page(doc), Some(4));
        assert_eq!(f.queue.pending_pages(doc), vec![5, 3, 0, 9]);
    }

    #[tokio::test]
    async fn unconfigured_backend_fails_fast() {
        let f = fixture();
        let err = f
            .factory
            .get_translated_page(Path::new(DOC), 0, BackendKind::Google)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownBackend(_)));
    }
}
