//! mangatl: manga page translation pipeline.
//! Priority queue and worker, page status machine, layered caches, and a
//! per-reader session view on top.

pub mod cache;
pub mod cancellation;
pub mod compositor;
pub mod config;
pub mod error;
pub mod factory;
pub mod library;
pub mod metrics;
pub mod ocr;
pub mod scheduler;
pub mod session;
pub mod state_machine;
pub mod translate;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cache::CacheManagerFactory;
use cancellation::ActiveDocument;
use compositor::ImageCompositor;
use config::Settings;
use factory::TranslationFactory;
use library::LibraryIndexer;
use metrics::MetricsRegistry;
use ocr::TextExtractor;
use scheduler::{TranslationQueue, TranslationWorker};
use session::SessionViewerManager;
use state_machine::StatusTable;
use translate::Translators;

pub use error::PipelineError;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter; `json` switches to one JSON object per line.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mangatl=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    // a subscriber installed earlier (tests, host app) wins
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Host-provided page source, OCR engine and renderer.
#[derive(Clone)]
pub struct Collaborators {
    pub library: Arc<dyn LibraryIndexer>,
    pub ocr: Arc<dyn TextExtractor>,
    pub compositor: Arc<dyn ImageCompositor>,
}

/// The running pipeline: caches, status table, queue, worker and factory.
pub struct Pipeline {
    settings: Settings,
    caches: Arc<CacheManagerFactory>,
    factory: Arc<TranslationFactory>,
    metrics: Arc<MetricsRegistry>,
    library: Arc<dyn LibraryIndexer>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build backends from `settings` and start the worker. Must be called
    /// inside a Tokio runtime.
    pub fn start(settings: Settings, collaborators: Collaborators) -> Result<Self, PipelineError> {
        settings.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let caches = Arc::new(CacheManagerFactory::new(
            settings.cache.clone(),
            settings.cache_root(),
        ));
        let translators =
            translate::build_translators(&settings, caches.text_cache()?, Arc::clone(&metrics))?;
        Self::start_with_translators(settings, caches, translators, collaborators, metrics)
    }

    /// Start with prebuilt translators, e.g. ones wrapping custom backends.
    pub fn start_with_translators(
        settings: Settings,
        caches: Arc<CacheManagerFactory>,
        translators: Translators,
        collaborators: Collaborators,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, PipelineError> {
        let status = Arc::new(StatusTable::new());
        let active = Arc::new(ActiveDocument::new());
        let queue = Arc::new(TranslationQueue::new(Arc::clone(&status), Arc::clone(&active)));
        let page_cache = caches.page_image_cache()?;

        let factory = Arc::new(TranslationFactory::new(
            Arc::clone(&queue),
            Arc::clone(&status),
            Arc::clone(&active),
            Arc::clone(&page_cache),
            translators.keys().copied(),
            settings.target_language.clone(),
            settings.wait_timeout(),
            Arc::clone(&metrics),
        ));

        let worker = TranslationWorker {
            queue,
            status,
            active,
            translators,
            page_cache,
            ocr_cache: caches.ocr_cache()?,
            library: Arc::clone(&collaborators.library),
            ocr: collaborators.ocr,
            compositor: collaborators.compositor,
            metrics: Arc::clone(&metrics),
        };
        let shutdown = CancellationToken::new();
        let handle = worker.spawn(shutdown.clone());

        info!(
            backend = %settings.backend,
            target_language = %settings.target_language,
            cache_root = %settings.cache_root().display(),
            "pipeline started"
        );
        Ok(Self {
            settings,
            caches,
            factory,
            metrics,
            library: collaborators.library,
            shutdown,
            worker: Some(handle),
        })
    }

    pub fn factory(&self) -> &Arc<TranslationFactory> {
        &self.factory
    }

    pub fn caches(&self) -> &Arc<CacheManagerFactory> {
        &self.caches
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// A reader session on the configured primary backend.
    pub fn new_session(&self) -> Result<SessionViewerManager, PipelineError> {
        Ok(SessionViewerManager::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.library),
            self.caches.page_list_cache()?,
            self.settings.backend_kind()?,
            self.settings.prefetch_pages,
        ))
    }

    /// Stop the worker and close every cache manager.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "translation worker ended abnormally");
            }
        }
        let closed = self.caches.close_all_managers();
        info!(closed, "pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
