//! Top-level pipeline error.
//! Layer-specific errors live next to their layer and convert via `From`.

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::compositor::ComposeError;
use crate::config::ConfigError;
use crate::library::LibraryError;
use crate::state_machine::PageStatus;
use crate::translate::TranslateError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("library error: {0}")]
    Library(#[from] LibraryError),

    #[error("compositor error: {0}")]
    Compose(#[from] ComposeError),

    #[error("backend '{0}' is not configured")]
    UnknownBackend(String),

    #[error("no document is open in this session")]
    NoActiveDocument,

    #[error("page {page} out of range for {} ({page_count} pages)", document.display())]
    PageOutOfRange {
        document: PathBuf,
        page: usize,
        page_count: usize,
    },

    #[error("invalid page status transition: {from} -> {to}")]
    InvalidTransition { from: PageStatus, to: PageStatus },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
