//! Priority translation queue and its worker.
//!
//! Priority is the distance from the reader's current page (lower runs
//! first), ties broken by arrival order. Moving the reading position
//! reprioritizes every queued task of the active document. Switching documents
//! drains foreign tasks from the queue while the status table is locked, so no
//! enqueue can interleave with the drain.
//!
//! The worker is a single Tokio task. Library loads, OCR, and composition run
//! on the blocking pool; each task checks its `GenerationGuard` before it
//! starts and before it writes results back.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ocr::OcrCache;
use crate::cache::page_image::{PageImageKey, PersistentPageCache};
use crate::cancellation::{Activation, ActiveDocument};
use crate::compositor::ImageCompositor;
use crate::error::PipelineError;
use crate::library::LibraryIndexer;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::ocr::{TextExtractor, TextRegion};
use crate::state_machine::{Claim, PageKey, PageStatus, StatusTable};
use crate::translate::{BackendKind, Translators};

/// One page waiting for (or undergoing) translation.
#[derive(Debug, Clone)]
pub struct TranslationTask {
    pub id: Uuid,
    pub document: PathBuf,
    pub page: usize,
    pub backend: BackendKind,
    pub target_language: String,
    pub priority: u64,
    pub status: PageStatus,
    pub result_image: Option<Bytes>,
    pub error_message: Option<String>,
    pub created_at: Instant,
    seq: u64,
}

impl TranslationTask {
    pub fn key(&self) -> PageKey {
        PageKey::new(self.document.clone(), self.page, self.backend)
    }

    pub fn image_key(&self) -> PageImageKey {
        PageImageKey::new(
            self.document.clone(),
            self.page,
            self.target_language.clone(),
            self.backend,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already queued or translating; the caller should wait for it.
    AlreadyPending,
    AlreadyTranslated,
    /// Failed earlier and no retry was requested.
    Failed,
    /// The document is not the active one.
    Inactive,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<u64, TranslationTask>,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, mut task: TranslationTask) {
        task.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((task.priority, task.seq)));
        self.tasks.insert(task.seq, task);
    }

    fn pop(&mut self) -> Option<TranslationTask> {
        while let Some(Reverse((_, seq))) = self.heap.pop() {
            if let Some(task) = self.tasks.remove(&seq) {
                return Some(task);
            }
        }
        None
    }

    fn rebuild_heap(&mut self) {
        self.heap = self
            .tasks
            .values()
            .map(|t| Reverse((t.priority, t.seq)))
            .collect();
    }
}

pub struct TranslationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    status: Arc<StatusTable>,
    active: Arc<ActiveDocument>,
}

impl TranslationQueue {
    pub fn new(status: Arc<StatusTable>, active: Arc<ActiveDocument>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            status,
            active,
        }
    }

    /// Queue a page at `priority` unless it is pending, translated, or
    /// (without `retry_failed`) failed. The active-document check, the status
    /// claim, and the push all happen under the status lock, so a page is never
    /// dispatched twice and a concurrent switch never leaves a foreign task
    /// behind.
    pub fn enqueue(
        &self,
        document: &Path,
        page: usize,
        backend: BackendKind,
        target_language: &str,
        priority: u64,
        retry_failed: bool,
    ) -> EnqueueOutcome {
        let key = PageKey::new(document, page, backend);
        let task = TranslationTask {
            id: Uuid::new_v4(),
            document: document.to_path_buf(),
            page,
            backend,
            target_language: target_language.to_string(),
            priority,
            status: PageStatus::Queued,
            result_image: None,
            error_message: None,
            created_at: Instant::now(),
            seq: 0,
        };
        let task_id = task.id;
        let claim = self.status.claim_if(
            &key,
            retry_failed,
            || self.active.is_active(document),
            || self.state.lock().push(task),
        );
        match claim {
            Claim::Claimed => {}
            Claim::Pending => return EnqueueOutcome::AlreadyPending,
            Claim::AlreadyTranslated => return EnqueueOutcome::AlreadyTranslated,
            Claim::Failed => return EnqueueOutcome::Failed,
            Claim::Inactive => {
                debug!(document = %document.display(), page, "enqueue for inactive document ignored");
                return EnqueueOutcome::Inactive;
            }
        }
        debug!(document = %document.display(), page, priority, task_id = %task_id, "page queued");
        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    /// Record the reading position and reprioritize that document's tasks.
    /// Returns how many tasks were reprioritized.
    pub fn set_current_page(&self, document: &Path, page: usize) -> usize {
        if !self.active.set_current_page(document, page) {
            return 0;
        }
        let mut state = self.state.lock();
        let mut touched = 0;
        for task in state.tasks.values_mut() {
            if task.document == document {
                task.priority = task.page.abs_diff(page) as u64;
                touched += 1;
            }
        }
        if touched > 0 {
            state.rebuild_heap();
        }
        touched
    }

    /// Make `document` active. Pending pages of any other document become
    /// Cancelled and leave the queue. Returns the cancelled keys.
    ///
    /// Lock order: status, then active document, then queue.
    pub fn switch_document(&self, document: &Path) -> Vec<PageKey> {
        let switched = self.status.with_document_switch(
            document,
            || self.active.activate(document) != Activation::Unchanged,
            |cancelled| {
                let mut state = self.state.lock();
                let before = state.tasks.len();
                state.tasks.retain(|_, t| t.document == document);
                state.rebuild_heap();
                debug!(drained = before - state.tasks.len(), "queue drained for document switch");
                cancelled
            },
        );
        let Some(cancelled) = switched else {
            return Vec::new();
        };
        info!(
            document = %document.display(),
            cancelled = cancelled.len(),
            "switched active document"
        );
        cancelled
    }

    pub fn try_pop(&self) -> Option<TranslationTask> {
        self.state.lock().pop()
    }

    /// Wait for the next task.
    pub async fn next(&self) -> TranslationTask {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Queued pages of `document` in the order they would run.
    #[cfg(test)]
    pub(crate) fn pending_pages(&self, document: &Path) -> Vec<usize> {
        let state = self.state.lock();
        let mut tasks: Vec<&TranslationTask> = state
            .tasks
            .values()
            .filter(|t| t.document == document)
            .collect();
        tasks.sort_by_key(|t| (t.priority, t.seq));
        tasks.into_iter().map(|t| t.page).collect()
    }
}

/// Everything the worker needs to turn a task into a translated page.
pub struct TranslationWorker {
    pub queue: Arc<TranslationQueue>,
    pub status: Arc<StatusTable>,
    pub active: Arc<ActiveDocument>,
    pub translators: Translators,
    pub page_cache: Arc<PersistentPageCache>,
    pub ocr_cache: Arc<OcrCache>,
    pub library: Arc<dyn LibraryIndexer>,
    pub ocr: Arc<dyn TextExtractor>,
    pub compositor: Arc<dyn ImageCompositor>,
    pub metrics: Arc<MetricsRegistry>,
}

impl TranslationWorker {
    /// Run until `shutdown` is cancelled. The task in flight at shutdown is
    /// abandoned at its next await point.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("translation worker started");
            loop {
                let task = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    task = self.queue.next() => task,
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.process(task) => {}
                }
            }
            info!("translation worker exiting");
        })
    }

    async fn process(&self, mut task: TranslationTask) {
        let key = task.key();
        self.metrics.record(
            metric_names::QUEUE_WAIT,
            task.created_at.elapsed().as_secs_f64() * 1000.0,
        );

        let Some(guard) = self.active.guard_for(&task.document) else {
            let _ = self.status.transition(&key, PageStatus::Cancelled);
            debug!(page = task.page, "task for inactive document dropped");
            return;
        };

        let image_key = task.image_key();
        if self.page_cache.contains(&image_key).await {
            self.metrics.incr(metric_names::PAGE_CACHE_HIT);
            let _ = self.status.transition(&key, PageStatus::Translated);
            return;
        }

        if self.status.transition(&key, PageStatus::Translating).is_err() {
            // cancelled between pop and start
            return;
        }
        task.status = PageStatus::Translating;

        let span = self.metrics.span(metric_names::PAGE_TRANSLATE);
        let result = self.translate_page(&task).await;

        if !guard.should_continue() {
            self.metrics.incr(metric_names::STALE_RESULT_DISCARDED);
            info!(
                document = %task.document.display(),
                page = task.page,
                generation = guard.my_generation(),
                "stale translation discarded"
            );
            return;
        }

        match result {
            Ok(image) => {
                if let Err(e) = self.page_cache.put(&image_key, &image).await {
                    task.error_message = Some(e.to_string());
                    self.metrics.incr(metric_names::PAGE_FAILED);
                    let _ = self.status.fail(&key, format!("page cache write failed: {e}"));
                    return;
                }
                task.result_image = Some(image);
                if self.status.transition(&key, PageStatus::Translated).is_ok() {
                    task.status = PageStatus::Translated;
                    let ms = span.finish();
                    info!(page = task.page, task_id = %task.id, elapsed_ms = ms, "page translated");
                }
            }
            Err(e) => {
                let message = e.to_string();
                task.error_message = Some(message.clone());
                task.status = PageStatus::Failed;
                self.metrics.incr(metric_names::PAGE_FAILED);
                let _ = self.status.fail(&key, message);
            }
        }
    }

    async fn translate_page(&self, task: &TranslationTask) -> Result<Bytes, PipelineError> {
        let translator = self
            .translators
            .get(&task.backend)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownBackend(task.backend.to_string()))?;

        let library = Arc::clone(&self.library);
        let document = task.document.clone();
        let page = task.page;
        let original = tokio::task::spawn_blocking(move || library.load_page(&document, page)).await??;

        let regions = self.regions_for(task, &original).await;
        if regions.is_empty() {
            debug!(page = task.page, "no text found, keeping original image");
            return Ok(original);
        }

        let texts: Vec<String> = regions.iter().map(|r| r.text.clone()).collect();
        let translations = translator
            .translate_batch(&texts, &task.target_language)
            .await?;

        let compositor = Arc::clone(&self.compositor);
        let composed = tokio::task::spawn_blocking(move || {
            compositor.compose(&original, &regions, &translations)
        })
        .await??;
        Ok(composed)
    }

    /// OCR regions, served from the OCR cache when possible. An OCR failure
    /// yields no regions and is not cached.
    async fn regions_for(&self, task: &TranslationTask, original: &Bytes) -> Arc<Vec<TextRegion>> {
        if let Some(regions) = self.ocr_cache.get(&task.document, task.page) {
            return regions;
        }
        let ocr = Arc::clone(&self.ocr);
        let image = original.clone();
        match tokio::task::spawn_blocking(move || ocr.extract(&image)).await {
            Ok(Ok(regions)) => {
                let regions = Arc::new(regions);
                self.ocr_cache
                    .insert(&task.document, task.page, Arc::clone(&regions));
                regions
            }
            Ok(Err(e)) => {
                warn!(page = task.page, error = %e, "OCR failed, keeping original image");
                Arc::new(Vec::new())
            }
            Err(e) => {
                warn!(page = task.page, error = %e, "OCR task panicked");
                Arc::new(Vec::new())
            }
        }
    }
}
