//! Active-document liveness: CancellationToken + generation guard.
//! Switching documents advances the generation and cancels the old token, so
//! in-flight work for the previous document cannot write results back.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Active {
    document: PathBuf,
    current_page: usize,
    token: CancellationToken,
}

/// Outcome of `ActiveDocument::activate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Unchanged,
    Switched { previous: Option<PathBuf> },
}

/// The one document currently being read, plus the reading position.
pub struct ActiveDocument {
    active: RwLock<Option<Active>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActiveDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveDocument {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make `document` active. Re-activating the same document is a no-op.
    pub fn activate(&self, document: &Path) -> Activation {
        let mut active = self.active.write();
        if active.as_ref().is_some_and(|a| a.document == document) {
            return Activation::Unchanged;
        }
        let previous = active.take().map(|a| {
            a.token.cancel();
            a.document
        });
        *active = Some(Active {
            document: document.to_path_buf(),
            current_page: 0,
            token: CancellationToken::new(),
        });
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            document = %document.display(),
            previous = ?previous,
            generation,
            "active document switched"
        );
        Activation::Switched { previous }
    }

    pub fn document(&self) -> Option<PathBuf> {
        self.active.read().as_ref().map(|a| a.document.clone())
    }

    pub fn is_active(&self, document: &Path) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|a| a.document == document)
    }

    /// Record the reading position. Ignored if `document` is not active.
    pub fn set_current_page(&self, document: &Path, page: usize) -> bool {
        match self.active.write().as_mut() {
            Some(a) if a.document == document => {
                a.current_page = page;
                true
            }
            _ => false,
        }
    }

    pub fn current_page(&self, document: &Path) -> Option<usize> {
        self.active
            .read()
            .as_ref()
            .filter(|a| a.document == document)
            .map(|a| a.current_page)
    }

    /// Guard for work on `document`, or `None` if it is not the active one.
    pub fn guard_for(&self, document: &Path) -> Option<GenerationGuard> {
        let active = self.active.read();
        let a = active.as_ref().filter(|a| a.document == document)?;
        Some(GenerationGuard {
            generation: Arc::clone(&self.generation),
            my_generation: self.generation.load(Ordering::SeqCst),
            token: a.token.child_token(),
        })
    }
}

/// Checked by a task before it starts and before it writes results.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not cancelled and still the current generation.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
