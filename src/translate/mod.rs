//! Translator backends and the cached text translator built on top of them.
//!
//! Backends are stateless adapters. `TextTranslator` (see `service`) adds
//! normalization, fingerprinting, the text cache, batching, and fallback.

pub mod google;
pub mod normalize;
pub mod service;
pub mod zhipu;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::text::TextCache;
use crate::config::Settings;
use crate::metrics::MetricsRegistry;

pub use service::TextTranslator;

/// Closed set of backends, resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Batch LLM backend; may reject content as sensitive.
    Zhipu,
    /// Single-text backend; never rejects content.
    Google,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Zhipu => "zhipu",
            BackendKind::Google => "google",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zhipu" | "glm" => Ok(BackendKind::Zhipu),
            "google" => Ok(BackendKind::Google),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Per-line result of a batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Translated(String),
    /// The backend flagged this line as unsafe to process.
    Rejected,
}

#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("API error: {0}")]
    ApiError(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("translation cancelled")]
    Cancelled,
    #[error("content rejected by backend: {0}")]
    ContentRejected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("operation not supported by this backend")]
    Unsupported,
}

impl TranslateError {
    /// Errors worth one more attempt through the fallback path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TranslateError::ApiError(_)
                | TranslateError::RateLimited { .. }
                | TranslateError::Timeout
                | TranslateError::MalformedResponse(_)
        )
    }
}

/// Network translator adapter.
#[async_trait]
pub trait TranslatorBackend: Send + Sync {
    fn id(&self) -> BackendKind;

    /// Translate one text. A policy refusal is `TranslateError::ContentRejected`.
    async fn translate_text(&self, text: &str, target_lang: &str) -> Result<String, TranslateError>;

    /// Maximum lines per batch request, `None` when batching is unsupported.
    fn batch_size(&self) -> Option<usize> {
        None
    }

    /// Translate lines in one request. Implementations return whatever the
    /// backend produced; alignment is checked by the caller.
    async fn translate_lines(
        &self,
        _lines: &[String],
        _target_lang: &str,
    ) -> Result<Vec<LineOutcome>, TranslateError> {
        Err(TranslateError::Unsupported)
    }
}

/// Translators by backend id. Resolved once; no hot swap.
pub type Translators = HashMap<BackendKind, Arc<TextTranslator>>;

/// Build a backend adapter for `kind` from settings.
pub fn build_backend(
    kind: BackendKind,
    settings: &Settings,
) -> Result<Arc<dyn TranslatorBackend>, TranslateError> {
    let backend: Arc<dyn TranslatorBackend> = match kind {
        BackendKind::Zhipu => Arc::new(zhipu::ZhipuBackend::new(&settings.zhipu)?),
        BackendKind::Google => Arc::new(google::GoogleBackend::new(&settings.google)?),
    };
    Ok(backend)
}

/// Build the primary translator (with its fallback) plus a standalone
/// translator for the fallback backend.
pub fn build_translators(
    settings: &Settings,
    cache: Arc<TextCache>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Translators, crate::PipelineError> {
    let primary_kind = settings.backend_kind()?;
    let fallback_kind = settings.fallback_kind()?;

    let primary = build_backend(primary_kind, settings)?;
    let fallback = match fallback_kind {
        Some(kind) => match build_backend(kind, settings) {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(backend = %kind, error = %e, "fallback backend init failed, continuing without it");
                None
            }
        },
        None => None,
    };

    let mut translators = Translators::new();
    translators.insert(
        primary_kind,
        Arc::new(TextTranslator::new(
            primary,
            fallback.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        )),
    );
    if let Some(fb) = fallback {
        let kind = fb.id();
        translators.insert(kind, Arc::new(TextTranslator::new(fb, None, cache, metrics)));
    }

    info!(
        primary = %primary_kind,
        fallback = ?fallback_kind,
        "translator backends initialized"
    );
    Ok(translators)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("Zhipu".parse::<BackendKind>(), Ok(BackendKind::Zhipu));
        assert_eq!("glm".parse::<BackendKind>(), Ok(BackendKind::Zhipu));
        assert_eq!(" google ".parse::<BackendKind>(), Ok(BackendKind::Google));
        assert!("deepl".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Google.to_string(), "google");
    }

    #[test]
    fn rejection_is_not_transient() {
        assert!(TranslateError::Timeout.is_transient());
        assert!(TranslateError::MalformedResponse("x".into()).is_transient());
        assert!(!TranslateError::ContentRejected("1301".into()).is_transient());
        assert!(!TranslateError::Cancelled.is_transient());
    }
}
