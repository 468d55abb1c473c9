//! Process-wide settings, read once at pipeline start.
//! JSON file (all fields optional) with environment overrides. Changing the
//! backend or credentials requires building a new `Pipeline`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::translate::BackendKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Active backend id ("zhipu" or "google").
    pub backend: String,
    /// Backend used when the primary rejects content or fails transiently.
    pub fallback_backend: Option<String>,
    pub target_language: String,
    /// Upper bound for `get_translated_page` waits.
    pub wait_timeout_ms: u64,
    /// Pages beyond the visible ones to prefetch.
    pub prefetch_pages: usize,
    pub zhipu: ZhipuSettings,
    pub google: GoogleSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZhipuSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub batch_size: usize,
    pub timeout_secs: u64,
    /// Minimum interval between requests.
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Root for persisted caches; `None` puts them under the system temp dir.
    pub root_dir: Option<PathBuf>,
    pub text_memory_capacity: usize,
    pub page_list_capacity: usize,
    pub ocr_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: "zhipu".into(),
            fallback_backend: Some("google".into()),
            target_language: "zh".into(),
            wait_timeout_ms: 60_000,
            prefetch_pages: 2,
            zhipu: ZhipuSettings::default(),
            google: GoogleSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for ZhipuSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://open.bigmodel.cn/api/paas/v4".into(),
            model: "glm-4-flash".into(),
            batch_size: 20,
            timeout_secs: 30,
            min_interval_ms: 100,
        }
    }
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            base_url: "https://translate.googleapis.com".into(),
            timeout_secs: 15,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root_dir: None,
            text_memory_capacity: 4096,
            page_list_capacity: 64,
            ocr_capacity: 256,
        }
    }
}

impl Settings {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = serde_json::from_str(&content)?;
        settings.apply_env();
        settings.validate()?;
        info!(path = %path.display(), backend = %settings.backend, "settings loaded");
        Ok(settings)
    }

    /// Defaults plus environment overrides. Used when no settings file exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ZHIPU_API_KEY") {
            self.zhipu.api_key = Some(key);
        }
        if let Ok(backend) = std::env::var("MANGATL_BACKEND") {
            self.backend = backend;
        }
        if let Ok(lang) = std::env::var("MANGATL_TARGET_LANG") {
            self.target_language = lang;
        }
        if let Ok(dir) = std::env::var("MANGATL_CACHE_DIR") {
            self.cache.root_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        self.fallback_kind()?;
        if self.target_language.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "target_language",
                reason: "must not be empty".into(),
            });
        }
        if self.zhipu.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "zhipu.batch_size",
                reason: "must be > 0".into(),
            });
        }
        if self.cache.text_memory_capacity == 0
            || self.cache.page_list_capacity == 0
            || self.cache.ocr_capacity == 0
        {
            return Err(ConfigError::Invalid {
                field: "cache",
                reason: "capacities must be > 0".into(),
            });
        }
        if self.wait_timeout_ms == 0 {
            warn!("wait_timeout_ms is 0, every uncached page request will time out");
        }
        Ok(())
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse().map_err(|reason| ConfigError::Invalid {
            field: "backend",
            reason,
        })
    }

    pub fn fallback_kind(&self) -> Result<Option<BackendKind>, ConfigError> {
        match &self.fallback_backend {
            None => Ok(None),
            Some(name) => {
                let kind: BackendKind = name.parse().map_err(|reason| ConfigError::Invalid {
                    field: "fallback_backend",
                    reason,
                })?;
                if kind == self.backend_kind()? {
                    return Ok(None);
                }
                Ok(Some(kind))
            }
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache
            .root_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mangatl-cache"))
    }
}
