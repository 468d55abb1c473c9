//! Library indexer interface: pages are addressable by index, nothing more.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

pub trait LibraryIndexer: Send + Sync {
    fn page_count(&self, document: &Path) -> Result<usize, LibraryError>;
    fn load_page(&self, document: &Path, page: usize) -> Result<Bytes, LibraryError>;
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("document not found: {}", .0.display())]
    DocumentNotFound(PathBuf),
    #[error("page {page} not found in {}", document.display())]
    PageNotFound { document: PathBuf, page: usize },
    #[error("library I/O error: {0}")]
    Io(#[from] std::io::Error),
}
