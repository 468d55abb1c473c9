//! In-process stand-ins for backends and collaborators, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::compositor::{ComposeError, ImageCompositor};
use crate::library::{LibraryError, LibraryIndexer};
use crate::ocr::{OcrError, TextExtractor, TextRegion};
use crate::translate::{BackendKind, LineOutcome, TranslateError, TranslatorBackend};

/// Backend that answers `"<id>:<text>"` and counts every call.
pub(crate) struct ScriptedBackend {
    id: BackendKind,
    batch_size: Option<usize>,
    rejected: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    misaligned: AtomicBool,
    batch_error: AtomicBool,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batch_lines: AtomicUsize,
}

impl ScriptedBackend {
    fn build(id: BackendKind, batch_size: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            id,
            batch_size,
            rejected: Mutex::new(HashSet::new()),
            unreachable: AtomicBool::new(false),
            misaligned: AtomicBool::new(false),
            batch_error: AtomicBool::new(false),
            single_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            batch_lines: AtomicUsize::new(0),
        })
    }

    pub fn batch(id: BackendKind, batch_size: usize) -> Arc<Self> {
        Self::build(id, Some(batch_size))
    }

    pub fn single(id: BackendKind) -> Arc<Self> {
        Self::build(id, None)
    }

    pub fn reject(&self, text: &str) {
        self.rejected.lock().insert(text.to_string());
    }

    pub fn set_unreachable(&self, on: bool) {
        self.unreachable.store(on, Ordering::SeqCst);
    }

    pub fn set_misaligned(&self, on: bool) {
        self.misaligned.store(on, Ordering::SeqCst);
    }

    pub fn set_batch_error(&self, on: bool) {
        self.batch_error.store(on, Ordering::SeqCst);
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn batch_lines(&self) -> usize {
        self.batch_lines.load(Ordering::SeqCst)
    }

    fn render(&self, text: &str) -> String {
        format!("{}:{}", self.id, text)
    }
}

#[async_trait]
impl TranslatorBackend for ScriptedBackend {
    fn id(&self) -> BackendKind {
        self.id
    }

    async fn translate_text(&self, text: &str, _target_lang: &str) -> Result<String, TranslateError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TranslateError::Timeout);
        }
        if self.rejected.lock().contains(text) {
            return Err(TranslateError::ContentRejected("sensitive".into()));
        }
        Ok(self.render(text))
    }

    fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        _target_lang: &str,
    ) -> Result<Vec<LineOutcome>, TranslateError> {
        if self.batch_size.is_none() {
            return Err(TranslateError::Unsupported);
        }
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_lines.fetch_add(lines.len(), Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TranslateError::Timeout);
        }
        if self.batch_error.load(Ordering::SeqCst) {
            return Err(TranslateError::ApiError("batch endpoint down".into()));
        }
        let rejected = self.rejected.lock();
        let mut out: Vec<LineOutcome> = lines
            .iter()
            .map(|line| {
                if rejected.contains(line) {
                    LineOutcome::Rejected
                } else {
                    LineOutcome::Translated(self.render(line))
                }
            })
            .collect();
        if self.misaligned.load(Ordering::SeqCst) {
            out.pop();
        }
        Ok(out)
    }
}

/// Documents held in memory; a page's bytes are its text lines.
#[derive(Default)]
pub(crate) struct MemoryLibrary {
    documents: HashMap<PathBuf, Vec<Bytes>>,
    loads: AtomicUsize,
}

impl MemoryLibrary {
    pub fn with_document(mut self, document: &str, pages: usize) -> Self {
        let pages = (0..pages)
            .map(|p| Bytes::from(format!("{document} p{p}")))
            .collect();
        self.documents.insert(PathBuf::from(document), pages);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl LibraryIndexer for MemoryLibrary {
    fn page_count(&self, document: &Path) -> Result<usize, LibraryError> {
        self.documents
            .get(document)
            .map(Vec::len)
            .ok_or_else(|| LibraryError::DocumentNotFound(document.to_path_buf()))
    }

    fn load_page(&self, document: &Path, page: usize) -> Result<Bytes, LibraryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let pages = self
            .documents
            .get(document)
            .ok_or_else(|| LibraryError::DocumentNotFound(document.to_path_buf()))?;
        pages.get(page).cloned().ok_or_else(|| LibraryError::PageNotFound {
            document: document.to_path_buf(),
            page,
        })
    }
}

/// One region per non-empty UTF-8 line of the page.
pub(crate) struct LineExtractor;

impl TextExtractor for LineExtractor {
    fn extract(&self, page_image: &[u8]) -> Result<Vec<TextRegion>, OcrError> {
        let text = std::str::from_utf8(page_image)
            .map_err(|e| OcrError::ProcessingFailed(e.to_string()))?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| TextRegion::new((0, i as u32 * 20, 100, 20), line))
            .collect())
    }
}

/// Renders the translations as the new page body.
pub(crate) struct JoinCompositor;

impl ImageCompositor for JoinCompositor {
    fn compose(
        &self,
        _original: &[u8],
        regions: &[TextRegion],
        translations: &[String],
    ) -> Result<Bytes, ComposeError> {
        if regions.len() != translations.len() {
            return Err(ComposeError(format!(
                "{} regions, {} translations",
                regions.len(),
                translations.len()
            )));
        }
        Ok(Bytes::from(translations.join("\n")))
    }
}
