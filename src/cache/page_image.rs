//! Persistent translated-page cache on local disk.
//! Layout: `<root>/<first 2 hex>/<64 hex>.bin`, named by the blake3 hash of
//! (document, page, target language, backend). Writes go to a temp file and
//! are renamed into place, so a reader sees either the old or the new image.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{CacheError, CacheKind, ManagedCache};
use crate::translate::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageImageKey {
    pub document: PathBuf,
    pub page: usize,
    pub target_language: String,
    pub backend: BackendKind,
}

impl PageImageKey {
    pub fn new(
        document: impl Into<PathBuf>,
        page: usize,
        target_language: impl Into<String>,
        backend: BackendKind,
    ) -> Self {
        Self {
            document: document.into(),
            page,
            target_language: target_language.into(),
            backend,
        }
    }

    /// Stable content address for this key.
    pub fn hash_hex(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.document.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(&(self.page as u64).to_le_bytes());
        hasher.update(b"|");
        hasher.update(self.target_language.as_bytes());
        hasher.update(b"|");
        hasher.update(self.backend.as_str().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

pub struct PersistentPageCache {
    root: PathBuf,
}

impl PersistentPageCache {
    pub fn open(root: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &PageImageKey) -> PathBuf {
        let hex = key.hash_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.bin"))
    }

    /// Read errors other than "not found" are logged and treated as a miss.
    pub async fn get(&self, key: &PageImageKey) -> Option<Bytes> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "page cache read failed");
                None
            }
        }
    }

    pub async fn contains(&self, key: &PageImageKey) -> bool {
        tokio::fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Store (overwriting) the image for `key`.
    pub async fn put(&self, key: &PageImageKey, image: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, image).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(document = %key.document.display(), page = key.page, bytes = image.len(), "page image cached");
        Ok(())
    }

    /// Returns whether an entry existed.
    pub async fn remove(&self, key: &PageImageKey) -> Result<bool, CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn count_entries(&self) -> std::io::Result<usize> {
        let mut count = 0;
        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(shard.path())? {
                if file?.path().extension().is_some_and(|ext| ext == "bin") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

impl ManagedCache for PersistentPageCache {
    fn kind(&self) -> CacheKind {
        CacheKind::PageImage
    }

    fn len(&self) -> usize {
        self.count_entries().unwrap_or_else(|e| {
            warn!(error = %e, "page cache scan failed");
            0
        })
    }

    fn clear(&self) {
        let result = std::fs::remove_dir_all(&self.root)
            .and_then(|_| std::fs::create_dir_all(&self.root));
        if let Err(e) = result {
            warn!(root = %self.root.display(), error = %e, "page cache clear failed");
        }
    }
}
