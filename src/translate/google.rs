//! Google web translate backend. Single text per request, no content filter:
//! this is the fallback for texts the primary backend refuses.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{BackendKind, TranslateError, TranslatorBackend};
use crate::config::GoogleSettings;

pub struct GoogleBackend {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleBackend {
    pub fn new(settings: &GoogleSettings) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TranslatorBackend for GoogleBackend {
    fn id(&self) -> BackendKind {
        BackendKind::Google
    }

    async fn translate_text(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        let result = self
            .http
            .get(format!("{}/translate_a/single", self.base_url))
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", target_lang),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(TranslateError::Timeout),
            Err(e) => return Err(TranslateError::ApiError(e.to_string())),
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            warn!("google backend rate limited");
            return Err(TranslateError::RateLimited { retry_after_ms: 0 });
        }
        if !status.is_success() {
            return Err(TranslateError::ApiError(format!("unexpected status {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TranslateError::MalformedResponse(e.to_string()))?;
        parse_segments(&body)
    }
}

/// Response shape: `[[["translated", "source", ...], ...], ...]`.
fn parse_segments(body: &serde_json::Value) -> Result<String, TranslateError> {
    let segments = body
        .get(0)
        .and_then(|v| v.as_array())
        .ok_or_else(|| TranslateError::MalformedResponse("missing segment array".into()))?;

    let translated: String = segments
        .iter()
        .filter_map(|seg| seg.get(0).and_then(|s| s.as_str()))
        .collect();

    if translated.is_empty() {
        return Err(TranslateError::MalformedResponse("no translated segments".into()));
    }
    Ok(translated)
}
