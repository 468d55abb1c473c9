//! Shared fixtures for pipeline integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use mangatl::cache::CacheManagerFactory;
use mangatl::compositor::{ComposeError, ImageCompositor};
use mangatl::config::Settings;
use mangatl::library::{LibraryError, LibraryIndexer};
use mangatl::metrics::MetricsRegistry;
use mangatl::ocr::{OcrError, TextExtractor, TextRegion};
use mangatl::translate::{
    BackendKind, LineOutcome, TextTranslator, TranslateError, TranslatorBackend, Translators,
};
use mangatl::{Collaborators, Pipeline};

/// Backend answering `"<id>:<line>"`, with switches for the failure modes
/// the pipeline has to survive.
pub struct StubBackend {
    id: BackendKind,
    batching: bool,
    delay: Duration,
    rejected: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    misaligned: AtomicBool,
    pub single_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
}

impl StubBackend {
    pub fn batching(id: BackendKind, delay: Duration) -> Arc<Self> {
        Self::build(id, true, delay)
    }

    pub fn single(id: BackendKind) -> Arc<Self> {
        Self::build(id, false, Duration::ZERO)
    }

    fn build(id: BackendKind, batching: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            batching,
            delay,
            rejected: Mutex::new(HashSet::new()),
            unreachable: AtomicBool::new(false),
            misaligned: AtomicBool::new(false),
            single_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        })
    }

    pub fn reject(&self, line: &str) {
        self.rejected.lock().insert(line.to_string());
    }

    pub fn set_unreachable(&self, on: bool) {
        self.unreachable.store(on, Ordering::SeqCst);
    }

    pub fn set_misaligned(&self, on: bool) {
        self.misaligned.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst) + self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslatorBackend for StubBackend {
    fn id(&self) -> BackendKind {
        self.id
    }

    async fn translate_text(&self, text: &str, _target_lang: &str) -> Result<String, TranslateError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TranslateError::Timeout);
        }
        if self.rejected.lock().contains(text) {
            return Err(TranslateError::ContentRejected("1301".into()));
        }
        Ok(format!("{}:{}", self.id, text))
    }

    fn batch_size(&self) -> Option<usize> {
        self.batching.then_some(20)
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        _target_lang: &str,
    ) -> Result<Vec<LineOutcome>, TranslateError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TranslateError::Timeout);
        }
        let rejected = self.rejected.lock();
        let mut out: Vec<LineOutcome> = lines
            .iter()
            .map(|l| {
                if rejected.contains(l) {
                    LineOutcome::Rejected
                } else {
                    LineOutcome::Translated(format!("{}:{}", self.id, l))
                }
            })
            .collect();
        if self.misaligned.load(Ordering::SeqCst) {
            out.truncate(out.len().saturating_sub(1));
        }
        Ok(out)
    }
}

/// In-memory library. A page's bytes are its text, one speech bubble per line.
#[derive(Default)]
pub struct BookLibrary {
    documents: HashMap<PathBuf, Vec<Bytes>>,
}

impl BookLibrary {
    /// `pages` pages, page `n` reading "<document> p<n>".
    pub fn with_book(mut self, document: &str, pages: usize) -> Self {
        let pages = (0..pages)
            .map(|n| Bytes::from(format!("{document} p{n}")))
            .collect();
        self.documents.insert(PathBuf::from(document), pages);
        self
    }

    pub fn with_pages(mut self, document: &str, pages: &[&str]) -> Self {
        let pages = pages.iter().map(|p| Bytes::from(p.to_string())).collect();
        self.documents.insert(PathBuf::from(document), pages);
        self
    }
}

impl LibraryIndexer for BookLibrary {
    fn page_count(&self, document: &Path) -> Result<usize, LibraryError> {
        self.documents
            .get(document)
            .map(Vec::len)
            .ok_or_else(|| LibraryError::DocumentNotFound(document.to_path_buf()))
    }

    fn load_page(&self, document: &Path, page: usize) -> Result<Bytes, LibraryError> {
        self.documents
            .get(document)
            .and_then(|pages| pages.get(page))
            .cloned()
            .ok_or_else(|| LibraryError::PageNotFound {
                document: document.to_path_buf(),
                page,
            })
    }
}

pub struct LineOcr;

impl TextExtractor for LineOcr {
    fn extract(&self, page_image: &[u8]) -> Result<Vec<TextRegion>, OcrError> {
        let text = String::from_utf8_lossy(page_image);
        Ok(text
            .lines()
            .enumerate()
            .map(|(i, line)| TextRegion::new((0, i as u32 * 32, 200, 32), line))
            .collect())
    }
}

pub struct JoinCompositor;

impl ImageCompositor for JoinCompositor {
    fn compose(
        &self,
        _original: &[u8],
        _regions: &[TextRegion],
        translations: &[String],
    ) -> Result<Bytes, ComposeError> {
        Ok(Bytes::from(translations.join("\n")))
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub primary: Arc<StubBackend>,
    pub fallback: Option<Arc<StubBackend>>,
}

pub fn start(
    root: &Path,
    library: BookLibrary,
    primary: Arc<StubBackend>,
    fallback: Option<Arc<StubBackend>>,
    wait_timeout: Duration,
) -> Harness {
    let mut settings = Settings::default();
    settings.cache.root_dir = Some(root.to_path_buf());
    settings.wait_timeout_ms = wait_timeout.as_millis() as u64;

    let metrics = Arc::new(MetricsRegistry::new());
    let caches = Arc::new(CacheManagerFactory::new(
        settings.cache.clone(),
        settings.cache_root(),
    ));
    let text_cache = caches.text_cache().expect("text cache");

    let mut translators = Translators::new();
    translators.insert(
        primary.id(),
        Arc::new(TextTranslator::new(
            primary.clone(),
            fallback.clone().map(|f| f as Arc<dyn TranslatorBackend>),
            text_cache,
            Arc::clone(&metrics),
        )),
    );

    let collaborators = Collaborators {
        library: Arc::new(library),
        ocr: Arc::new(LineOcr),
        compositor: Arc::new(JoinCompositor),
    };
    let pipeline =
        Pipeline::start_with_translators(settings, caches, translators, collaborators, metrics)
            .expect("pipeline start");
    Harness {
        pipeline,
        primary,
        fallback,
    }
}
