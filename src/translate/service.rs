//! Cached text translation over a primary backend with an optional fallback.
//!
//! Cache semantics:
//! - hit, not sensitive: served as is;
//! - hit, sensitive: revalidated (fallback, else primary) on every read; a
//!   successful revalidation rewrites the entry as not sensitive, a failed one
//!   serves the cached text;
//! - miss: primary; a content rejection goes to the fallback and is cached as
//!   sensitive; a transient error gets one fallback attempt that is not cached.
//!
//! Batches never guess alignment: a reply with the wrong number of lines, or a
//! failed batch request, is retried one text at a time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::normalize::{fingerprint, normalize_text, Fingerprint};
use super::{BackendKind, LineOutcome, TranslateError, TranslatorBackend};
use crate::cache::text::{TextCache, TextEntry};
use crate::metrics::{metric_names, MetricsRegistry};

/// Uncached text awaiting translation, with every input slot it fills.
struct PendingText {
    normalized: String,
    key: Fingerprint,
    slots: Vec<usize>,
}

pub struct TextTranslator {
    primary: Arc<dyn TranslatorBackend>,
    fallback: Option<Arc<dyn TranslatorBackend>>,
    cache: Arc<TextCache>,
    metrics: Arc<MetricsRegistry>,
}

impl TextTranslator {
    pub fn new(
        primary: Arc<dyn TranslatorBackend>,
        fallback: Option<Arc<dyn TranslatorBackend>>,
        cache: Arc<TextCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache,
            metrics,
        }
    }

    /// Backend id used in fingerprints and page keys.
    pub fn backend_id(&self) -> BackendKind {
        self.primary.id()
    }

    pub async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Ok(String::new());
        }
        let key = fingerprint(&normalized, target_lang, self.backend_id());

        if let Some(entry) = self.cache.get(&key) {
            self.metrics.incr(metric_names::TEXT_CACHE_HIT);
            if !entry.is_sensitive {
                return Ok(entry.translated_text);
            }
            return Ok(self.revalidate(key, entry, target_lang).await);
        }
        self.metrics.incr(metric_names::TEXT_CACHE_MISS);
        self.translate_uncached(&normalized, key, target_lang).await
    }

    /// Translate `texts`, preserving length and order.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
    ) -> Result<Vec<String>, TranslateError> {
        let mut results: Vec<Option<String>> = vec![None; texts.len()];
        let mut pending: Vec<PendingText> = Vec::new();
        let mut pending_index: HashMap<Fingerprint, usize> = HashMap::new();

        for (slot, text) in texts.iter().enumerate() {
            let normalized = normalize_text(text);
            if normalized.is_empty() {
                results[slot] = Some(String::new());
                continue;
            }
            let key = fingerprint(&normalized, target_lang, self.backend_id());
            if let Some(&idx) = pending_index.get(&key) {
                pending[idx].slots.push(slot);
                continue;
            }
            match self.cache.get(&key) {
                Some(entry) => {
                    self.metrics.incr(metric_names::TEXT_CACHE_HIT);
                    let text = if entry.is_sensitive {
                        self.revalidate(key, entry, target_lang).await
                    } else {
                        entry.translated_text
                    };
                    results[slot] = Some(text);
                }
                None => {
                    self.metrics.incr(metric_names::TEXT_CACHE_MISS);
                    pending_index.insert(key, pending.len());
                    pending.push(PendingText {
                        normalized,
                        key,
                        slots: vec![slot],
                    });
                }
            }
        }

        if !pending.is_empty() {
            let translated = match self.primary.batch_size() {
                Some(size) => self.translate_batched(&pending, size, target_lang).await?,
                None => {
                    let mut out = Vec::with_capacity(pending.len());
                    for p in &pending {
                        out.push(self.translate_uncached(&p.normalized, p.key, target_lang).await?);
                    }
                    out
                }
            };
            for (p, text) in pending.iter().zip(translated) {
                for &slot in &p.slots {
                    results[slot] = Some(text.clone());
                }
            }
        }

        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn translate_batched(
        &self,
        pending: &[PendingText],
        batch_size: usize,
        target_lang: &str,
    ) -> Result<Vec<String>, TranslateError> {
        let mut out = Vec::with_capacity(pending.len());

        for chunk in pending.chunks(batch_size.max(1)) {
            let lines: Vec<String> = chunk.iter().map(|p| p.normalized.clone()).collect();
            let span = self.metrics.span(metric_names::BACKEND_BATCH);
            let result = self.primary.translate_lines(&lines, target_lang).await;
            span.finish();

            match result {
                Ok(outcomes) if outcomes.len() == chunk.len() => {
                    for (p, outcome) in chunk.iter().zip(outcomes) {
                        let text = match outcome {
                            LineOutcome::Translated(text) => {
                                self.cache.put(p.key, entry(&text, false, &p.normalized));
                                text
                            }
                            LineOutcome::Rejected => {
                                self.metrics.incr(metric_names::CONTENT_REJECTED);
                                self.via_fallback(
                                    &p.normalized,
                                    p.key,
                                    target_lang,
                                    true,
                                    TranslateError::ContentRejected("batch line".into()),
                                )
                                .await?
                            }
                        };
                        out.push(text);
                    }
                }
                Ok(outcomes) => {
                    self.metrics.incr(metric_names::BATCH_MISALIGNED);
                    warn!(
                        sent = chunk.len(),
                        received = outcomes.len(),
                        "batch reply misaligned, retrying lines individually"
                    );
                    for p in chunk {
                        out.push(self.translate_uncached(&p.normalized, p.key, target_lang).await?);
                    }
                }
                Err(e) => {
                    warn!(error = %e, size = chunk.len(), "batch request failed, retrying lines individually");
                    for p in chunk {
                        out.push(self.translate_uncached(&p.normalized, p.key, target_lang).await?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Single-text path for a cache miss.
    async fn translate_uncached(
        &self,
        normalized: &str,
        key: Fingerprint,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        let span = self.metrics.span(metric_names::BACKEND_SINGLE);
        let result = self.primary.translate_text(normalized, target_lang).await;
        span.finish();

        match result {
            Ok(text) => {
                self.cache.put(key, entry(&text, false, normalized));
                Ok(text)
            }
            Err(TranslateError::ContentRejected(reason)) => {
                self.metrics.incr(metric_names::CONTENT_REJECTED);
                debug!(%reason, "primary rejected text, using fallback");
                self.via_fallback(
                    normalized,
                    key,
                    target_lang,
                    true,
                    TranslateError::ContentRejected(reason),
                )
                .await
            }
            Err(e) if e.is_transient() && self.fallback.is_some() => {
                warn!(error = %e, "primary failed, retrying once through fallback");
                self.via_fallback(normalized, key, target_lang, false, e).await
            }
            Err(e) => Err(e),
        }
    }

    /// Fallback translation. Rejections are cached as sensitive; transient
    /// retries are returned uncached so the primary gets the next request.
    async fn via_fallback(
        &self,
        normalized: &str,
        key: Fingerprint,
        target_lang: &str,
        rejected: bool,
        primary_error: TranslateError,
    ) -> Result<String, TranslateError> {
        let Some(fallback) = &self.fallback else {
            return Err(primary_error);
        };
        match fallback.translate_text(normalized, target_lang).await {
            Ok(text) => {
                if rejected {
                    self.cache.put(key, entry(&text, true, normalized));
                }
                Ok(text)
            }
            Err(e) => {
                warn!(error = %e, fallback = %fallback.id(), "fallback translation failed");
                Err(e)
            }
        }
    }

    async fn revalidate(&self, key: Fingerprint, cached: TextEntry, target_lang: &str) -> String {
        self.metrics.incr(metric_names::SENSITIVE_REVALIDATE);
        let backend = self.fallback.as_ref().unwrap_or(&self.primary);
        match backend.translate_text(&cached.original_text, target_lang).await {
            Ok(text) => {
                self.cache.put(key, entry(&text, false, &cached.original_text));
                text
            }
            Err(e) => {
                debug!(error = %e, "sensitive entry revalidation failed, serving cached text");
                cached.translated_text
            }
        }
    }
}

fn entry(text: &str, is_sensitive: bool, original: &str) -> TextEntry {
    TextEntry {
        translated_text: text.to_string(),
        is_sensitive,
        original_text: original.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;

    fn translator(
        primary: &Arc<ScriptedBackend>,
        fallback: Option<&Arc<ScriptedBackend>>,
    ) -> (TextTranslator, Arc<TextCache>) {
        let cache = Arc::new(TextCache::in_memory(128));
        let t = TextTranslator::new(
            primary.clone(),
            fallback.map(|f| f.clone() as Arc<dyn TranslatorBackend>),
            Arc::clone(&cache),
            Arc::new(MetricsRegistry::new()),
        );
        (t, cache)
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn cache_hit_skips_backend() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        let (t, _) = translator(&primary, None);

        assert_eq!(t.translate(" Hello\n there ", "zh").await.unwrap(), "zhipu:Hello there");
        assert_eq!(t.translate("Hello there", "zh").await.unwrap(), "zhipu:Hello there");
        assert_eq!(primary.single_calls(), 1);

        // target language is part of the fingerprint
        t.translate("Hello there", "en").await.unwrap();
        assert_eq!(primary.single_calls(), 2);
    }

    #[tokio::test]
    async fn rejection_goes_to_fallback_and_is_revalidated() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        let fallback = ScriptedBackend::single(BackendKind::Google);
        primary.reject("blood everywhere");
        let (t, cache) = translator(&primary, Some(&fallback));

        let out = t.translate("blood everywhere", "zh").await.unwrap();
        assert_eq!(out, "google:blood everywhere");
        assert_eq!(fallback.single_calls(), 1);
        let key = fingerprint("blood everywhere", "zh", BackendKind::Zhipu);
        assert!(cache.get(&key).unwrap().is_sensitive);

        // the sensitive hit is not trusted: fallback runs again, entry is cleared
        let out = t.translate("blood everywhere", "zh").await.unwrap();
        assert_eq!(out, "google:blood everywhere");
        assert_eq!(fallback.single_calls(), 2);
        assert!(!cache.get(&key).unwrap().is_sensitive);

        t.translate("blood everywhere", "zh").await.unwrap();
        assert_eq!(fallback.single_calls(), 2);
        assert_eq!(primary.single_calls(), 1);
    }

    #[tokio::test]
    async fn failed_revalidation_serves_cached_text_and_retries_next_read() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        let fallback = ScriptedBackend::single(BackendKind::Google);
        primary.reject("gore");
        let (t, cache) = translator(&primary, Some(&fallback));

        t.translate("gore", "zh").await.unwrap();
        fallback.set_unreachable(true);

        for expected_calls in 2..5 {
            assert_eq!(t.translate("gore", "zh").await.unwrap(), "google:gore");
            assert_eq!(fallback.single_calls(), expected_calls);
        }
        let key = fingerprint("gore", "zh", BackendKind::Zhipu);
        assert!(cache.get(&key).unwrap().is_sensitive);
    }

    #[tokio::test]
    async fn rejection_without_fallback_is_an_error() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        primary.reject("gore");
        let (t, _) = translator(&primary, None);
        assert!(matches!(
            t.translate("gore", "zh").await,
            Err(TranslateError::ContentRejected(_))
        ));
    }

    #[tokio::test]
    async fn transient_error_retries_through_fallback_without_caching() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        let fallback = ScriptedBackend::single(BackendKind::Google);
        primary.set_unreachable(true);
        let (t, cache) = translator(&primary, Some(&fallback));

        assert_eq!(t.translate("hi", "zh").await.unwrap(), "google:hi");
        assert!(cache.get(&fingerprint("hi", "zh", BackendKind::Zhipu)).is_none());

        primary.set_unreachable(false);
        assert_eq!(t.translate("hi", "zh").await.unwrap(), "zhipu:hi");
    }

    #[tokio::test]
    async fn misaligned_batch_is_retried_per_line_in_order() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        primary.set_misaligned(true);
        let (t, _) = translator(&primary, None);

        let input = texts(&["one", "two", "three", "four"]);
        let out = t.translate_batch(&input, "zh").await.unwrap();
        assert_eq!(out, texts(&["zhipu:one", "zhipu:two", "zhipu:three", "zhipu:four"]));
        assert_eq!(primary.batch_calls(), 1);
        assert_eq!(primary.single_calls(), 4);
    }

    #[tokio::test]
    async fn rejected_line_alone_goes_to_fallback() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        let fallback = ScriptedBackend::single(BackendKind::Google);
        primary.reject("bad line");
        let (t, cache) = translator(&primary, Some(&fallback));

        let input = texts(&["good", "bad line", "fine"]);
        let out = t.translate_batch(&input, "zh").await.unwrap();
        assert_eq!(out, texts(&["zhipu:good", "google:bad line", "zhipu:fine"]));
        assert_eq!(fallback.single_calls(), 1);
        assert_eq!(primary.single_calls(), 0);
        assert!(!cache.get(&fingerprint("good", "zh", BackendKind::Zhipu)).unwrap().is_sensitive);
        assert!(cache.get(&fingerprint("bad line", "zh", BackendKind::Zhipu)).unwrap().is_sensitive);
    }

    #[tokio::test]
    async fn failed_batch_degrades_to_single_requests() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 20);
        primary.set_batch_error(true);
        let (t, _) = translator(&primary, None);

        let out = t.translate_batch(&texts(&["a", "b"]), "zh").await.unwrap();
        assert_eq!(out, texts(&["zhipu:a", "zhipu:b"]));
        assert_eq!(primary.single_calls(), 2);
    }

    #[tokio::test]
    async fn batch_chunks_dedupes_and_reuses_cache() {
        let primary = ScriptedBackend::batch(BackendKind::Zhipu, 2);
        let (t, _) = translator(&primary, None);
        t.translate("cached", "zh").await.unwrap();

        let input = texts(&["cached", "x", "", "y", "x", "z"]);
        let out = t.translate_batch(&input, "zh").await.unwrap();
        assert_eq!(
            out,
            texts(&["zhipu:cached", "zhipu:x", "", "zhipu:y", "zhipu:x", "zhipu:z"])
        );
        // x, y, z uncached → two requests of at most two lines
        assert_eq!(primary.batch_calls(), 2);
        assert_eq!(primary.batch_lines(), 3);
    }

    #[tokio::test]
    async fn single_backend_batches_one_by_one() {
        let primary = ScriptedBackend::single(BackendKind::Google);
        let (t, _) = translator(&primary, None);
        let out = t.translate_batch(&texts(&["a", "b"]), "zh").await.unwrap();
        assert_eq!(out, texts(&["google:a", "google:b"]));
        assert_eq!(primary.single_calls(), 2);
        assert_eq!(primary.batch_calls(), 0);
    }
}
