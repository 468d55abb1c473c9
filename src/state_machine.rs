//! Page-level status machine.
//! Unknown → Queued → Translating → Translated | Failed.
//! Failed → Queued on explicit retry; Cancelled only on document switch.
//!
//! Every key owns a `watch` channel so waiters are woken on each transition
//! instead of polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::translate::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PageStatus {
    Unknown,
    Queued,
    Translating,
    Translated,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PageStatus::Unknown => "Unknown",
            PageStatus::Queued => "Queued",
            PageStatus::Translating => "Translating",
            PageStatus::Translated => "Translated",
            PageStatus::Failed => "Failed",
            PageStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl PageStatus {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: PageStatus) -> bool {
        matches!(
            (self, next),
            (PageStatus::Unknown, PageStatus::Queued)
                | (PageStatus::Queued, PageStatus::Translating)
                | (PageStatus::Translating, PageStatus::Translated)
                | (PageStatus::Translating, PageStatus::Failed)
                | (PageStatus::Failed, PageStatus::Queued) // explicit retry
                | (PageStatus::Queued, PageStatus::Cancelled) // document switch
                | (PageStatus::Translating, PageStatus::Cancelled)
                | (PageStatus::Cancelled, PageStatus::Queued) // silent re-queue
                // persistent cache already holds the image
                | (PageStatus::Unknown, PageStatus::Translated)
                | (PageStatus::Queued, PageStatus::Translated)
                | (PageStatus::Failed, PageStatus::Translated)
                | (PageStatus::Cancelled, PageStatus::Translated)
                | (PageStatus::Translated, PageStatus::Translated)
        )
    }

    /// No further progress without a new request.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PageStatus::Translated | PageStatus::Failed | PageStatus::Cancelled
        )
    }

    pub fn is_pending(self) -> bool {
        matches!(self, PageStatus::Queued | PageStatus::Translating)
    }
}

/// Status table key: one status per (document, page, backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub document: PathBuf,
    pub page: usize,
    pub backend: BackendKind,
}

impl PageKey {
    pub fn new(document: impl Into<PathBuf>, page: usize, backend: BackendKind) -> Self {
        Self {
            document: document.into(),
            page,
            backend,
        }
    }
}

/// Result of an atomic "claim this page for translation" attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Status moved to Queued; the caller must enqueue the task.
    Claimed,
    /// Someone else already queued or is translating it.
    Pending,
    AlreadyTranslated,
    /// Failed and the caller did not ask for a retry.
    Failed,
    /// Refused before the status was looked at.
    Inactive,
}

struct StatusSlot {
    tx: watch::Sender<PageStatus>,
    error: Option<String>,
}

impl StatusSlot {
    fn new(status: PageStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self { tx, error: None }
    }

    fn status(&self) -> PageStatus {
        *self.tx.borrow()
    }

    fn set(&mut self, status: PageStatus) {
        // send_replace never fails, even without receivers
        self.tx.send_replace(status);
    }
}

/// Status of every page the pipeline has seen, behind one lock.
#[derive(Default)]
pub struct StatusTable {
    slots: Mutex<HashMap<PageKey, StatusSlot>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PageKey) -> PageStatus {
        self.slots
            .lock()
            .get(key)
            .map(StatusSlot::status)
            .unwrap_or(PageStatus::Unknown)
    }

    pub fn error_message(&self, key: &PageKey) -> Option<String> {
        self.slots.lock().get(key).and_then(|s| s.error.clone())
    }

    /// Validated transition. Returns the previous status.
    pub fn transition(&self, key: &PageKey, next: PageStatus) -> Result<PageStatus, PipelineError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| StatusSlot::new(PageStatus::Unknown));
        let current = slot.status();
        if !current.can_transition_to(next) {
            debug!(page = key.page, from = %current, to = %next, "page transition refused");
            return Err(PipelineError::InvalidTransition { from: current, to: next });
        }
        if next != PageStatus::Failed {
            slot.error = None;
        }
        slot.set(next);
        debug!(
            document = %key.document.display(),
            page = key.page,
            backend = %key.backend,
            from = %current,
            to = %next,
            "page_transition"
        );
        Ok(current)
    }

    /// Translating → Failed with an error message.
    pub fn fail(&self, key: &PageKey, message: impl Into<String>) -> Result<(), PipelineError> {
        let message = message.into();
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return Err(PipelineError::InvalidTransition {
                from: PageStatus::Unknown,
                to: PageStatus::Failed,
            });
        };
        let current = slot.status();
        if !current.can_transition_to(PageStatus::Failed) {
            return Err(PipelineError::InvalidTransition {
                from: current,
                to: PageStatus::Failed,
            });
        }
        warn!(
            document = %key.document.display(),
            page = key.page,
            error = %message,
            "page translation failed"
        );
        slot.error = Some(message);
        slot.set(PageStatus::Failed);
        Ok(())
    }

    /// Atomically move the page to Queued unless it is pending or translated.
    /// A Failed page is only reclaimed when `retry_failed` is set.
    ///
    /// `admit` runs before the lookup and `on_claimed` after a successful
    /// claim, both under the status lock. Neither may call back into the table.
    pub fn claim_if(
        &self,
        key: &PageKey,
        retry_failed: bool,
        admit: impl FnOnce() -> bool,
        on_claimed: impl FnOnce(),
    ) -> Claim {
        let mut slots = self.slots.lock();
        if !admit() {
            return Claim::Inactive;
        }
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| StatusSlot::new(PageStatus::Unknown));
        match slot.status() {
            PageStatus::Queued | PageStatus::Translating => Claim::Pending,
            PageStatus::Translated => Claim::AlreadyTranslated,
            PageStatus::Failed if !retry_failed => Claim::Failed,
            PageStatus::Unknown | PageStatus::Failed | PageStatus::Cancelled => {
                slot.error = None;
                slot.set(PageStatus::Queued);
                on_claimed();
                Claim::Claimed
            }
        }
    }

    /// Cache-hit shortcut: mark the page Translated unless a translation is
    /// queued or running, which then keeps its own status. Returns whether the
    /// status changed.
    pub fn mark_cached(&self, key: &PageKey) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| StatusSlot::new(PageStatus::Unknown));
        let current = slot.status();
        if current.is_pending() || current == PageStatus::Translated {
            return false;
        }
        slot.error = None;
        slot.set(PageStatus::Translated);
        debug!(page = key.page, from = %current, "page served from cache");
        true
    }

    /// Subscribe to a key's status changes. Creates an Unknown slot if needed.
    pub fn subscribe(&self, key: &PageKey) -> watch::Receiver<PageStatus> {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| StatusSlot::new(PageStatus::Unknown))
            .tx
            .subscribe()
    }

    /// Forget a key. Current waiters observe a closed channel.
    pub fn remove(&self, key: &PageKey) -> Option<PageStatus> {
        self.slots.lock().remove(key).map(|s| s.status())
    }

    /// Run `activate` under the status lock. When it reports a switch, demote
    /// every pending page of other documents to Cancelled and hand the demoted
    /// keys to `drain`, still in the same critical section. Returns `None`
    /// when `activate` reports no switch.
    pub fn with_document_switch<R>(
        &self,
        keep: &Path,
        activate: impl FnOnce() -> bool,
        drain: impl FnOnce(Vec<PageKey>) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock();
        if !activate() {
            return None;
        }
        let mut cancelled = Vec::new();
        for (key, slot) in slots.iter_mut() {
            if key.document != keep && slot.status().is_pending() {
                slot.set(PageStatus::Cancelled);
                cancelled.push(key.clone());
            }
        }
        Some(drain(cancelled))
    }

    /// All known statuses for one document, sorted by page then backend.
    pub fn snapshot(&self, document: &Path) -> Vec<(PageKey, PageStatus)> {
        let slots = self.slots.lock();
        let mut out: Vec<(PageKey, PageStatus)> = slots
            .iter()
            .filter(|(k, _)| k.document == document)
            .map(|(k, s)| (k.clone(), s.status()))
            .collect();
        out.sort_by(|(a, _), (b, _)| a.page.cmp(&b.page).then(a.backend.cmp(&b.backend)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(page: usize) -> PageKey {
        PageKey::new("/m/a.cbz", page, BackendKind::Zhipu)
    }

    fn claim(table: &StatusTable, key: &PageKey, retry_failed: bool) -> Claim {
        table.claim_if(key, retry_failed, || true, || {})
    }

    #[test]
    fn happy_path_and_invalid_jumps() {
        let table = StatusTable::new();
        let k = key(0);
        assert_eq!(table.get(&k), PageStatus::Unknown);

        assert!(table.transition(&k, PageStatus::Translating).is_err());
        table.transition(&k, PageStatus::Queued).unwrap();
        table.transition(&k, PageStatus::Translating).unwrap();
        table.transition(&k, PageStatus::Translated).unwrap();
        assert!(matches!(
            table.transition(&k, PageStatus::Queued),
            Err(PipelineError::InvalidTransition {
                from: PageStatus::Translated,
                to: PageStatus::Queued
            })
        ));
    }

    #[test]
    fn failed_is_sticky_until_explicit_retry() {
        let table = StatusTable::new();
        let k = key(1);
        assert_eq!(claim(&table, &k, false), Claim::Claimed);
        table.transition(&k, PageStatus::Translating).unwrap();
        table.fail(&k, "backend unreachable").unwrap();

        assert_eq!(table.get(&k), PageStatus::Failed);
        assert_eq!(table.error_message(&k).as_deref(), Some("backend unreachable"));
        assert_eq!(claim(&table, &k, false), Claim::Failed);

        assert_eq!(claim(&table, &k, true), Claim::Claimed);
        assert_eq!(table.get(&k), PageStatus::Queued);
        assert_eq!(table.error_message(&k), None);
    }

    #[test]
    fn claim_is_exclusive() {
        let table = StatusTable::new();
        let k = key(2);
        assert_eq!(claim(&table, &k, true), Claim::Claimed);
        assert_eq!(claim(&table, &k, true), Claim::Pending);
        table.transition(&k, PageStatus::Translating).unwrap();
        assert_eq!(claim(&table, &k, true), Claim::Pending);
        table.transition(&k, PageStatus::Translated).unwrap();
        assert_eq!(claim(&table, &k, true), Claim::AlreadyTranslated);
    }

    #[test]
    fn document_switch_cancels_only_pending_pages_of_other_documents() {
        let table = StatusTable::new();
        let a0 = key(0);
        let a1 = key(1);
        let a2 = key(2);
        let b0 = PageKey::new("/m/b.cbz", 0, BackendKind::Zhipu);

        claim(&table, &a0, true);
        claim(&table, &a1, true);
        table.transition(&a1, PageStatus::Translating).unwrap();
        claim(&table, &a2, true);
        table.transition(&a2, PageStatus::Translating).unwrap();
        table.transition(&a2, PageStatus::Translated).unwrap();
        claim(&table, &b0, true);

        let mut cancelled = table
            .with_document_switch(Path::new("/m/b.cbz"), || true, |cancelled| cancelled)
            .unwrap();
        cancelled.sort_by_key(|k| k.page);
        assert_eq!(cancelled, vec![a0.clone(), a1.clone()]);
        assert_eq!(table.get(&a0), PageStatus::Cancelled);
        assert_eq!(table.get(&a1), PageStatus::Cancelled);
        assert_eq!(table.get(&a2), PageStatus::Translated);
        assert_eq!(table.get(&b0), PageStatus::Queued);

        // a cancelled translation cannot report back
        assert!(table.transition(&a1, PageStatus::Translated).is_err());
        assert!(table.fail(&a1, "late").is_err());
        // but it may be re-queued silently
        assert_eq!(claim(&table, &a0, false), Claim::Claimed);
    }

    #[test]
    fn unchanged_activation_cancels_nothing() {
        let table = StatusTable::new();
        let a0 = key(0);
        claim(&table, &a0, true);

        let drained = table.with_document_switch(Path::new("/m/b.cbz"), || false, |c| c.len());
        assert_eq!(drained, None);
        assert_eq!(table.get(&a0), PageStatus::Queued);
    }

    #[test]
    fn refused_admission_leaves_the_page_untouched() {
        let table = StatusTable::new();
        let k = key(5);
        let mut pushed = false;
        assert_eq!(table.claim_if(&k, true, || false, || pushed = true), Claim::Inactive);
        assert!(!pushed);
        assert_eq!(table.get(&k), PageStatus::Unknown);

        assert_eq!(table.claim_if(&k, true, || true, || pushed = true), Claim::Claimed);
        assert!(pushed);
        // a second claim loses and never reaches the push
        let mut pushed_again = false;
        assert_eq!(table.claim_if(&k, true, || true, || pushed_again = true), Claim::Pending);
        assert!(!pushed_again);
    }

    #[test]
    fn cache_hit_does_not_overwrite_a_running_translation() {
        let table = StatusTable::new();
        let k = key(6);
        claim(&table, &k, true);
        table.transition(&k, PageStatus::Translating).unwrap();
        assert!(!table.mark_cached(&k));
        assert_eq!(table.get(&k), PageStatus::Translating);

        let idle = key(7);
        assert!(table.mark_cached(&idle));
        assert_eq!(table.get(&idle), PageStatus::Translated);
        assert!(!table.mark_cached(&idle));
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let table = StatusTable::new();
        let k = key(3);
        let mut rx = table.subscribe(&k);
        assert_eq!(*rx.borrow(), PageStatus::Unknown);

        claim(&table, &k, true);
        table.transition(&k, PageStatus::Translating).unwrap();
        table.transition(&k, PageStatus::Translated).unwrap();

        let status = rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(*status, PageStatus::Translated);
    }

    #[test]
    fn snapshot_is_scoped_to_one_document() {
        let table = StatusTable::new();
        claim(&table, &key(4), true);
        claim(&table, &PageKey::new("/m/b.cbz", 4, BackendKind::Zhipu), true);
        let snap = table.snapshot(Path::new("/m/a.cbz"));
        assert_eq!(snap, vec![(key(4), PageStatus::Queued)]);
    }
}
