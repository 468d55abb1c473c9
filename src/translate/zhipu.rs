//! Zhipu GLM chat-completions backend.
//! High-throughput batch translation: one numbered line in, one line out.
//! Content filtering surfaces three ways: HTTP error code 1301,
//! `finish_reason == "sensitive"`, or a per-line `<<UNSAFE>>` marker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BackendKind, LineOutcome, TranslateError, TranslatorBackend};
use crate::config::ZhipuSettings;

/// Marker the model is told to emit for a line it refuses to translate.
pub const UNSAFE_MARKER: &str = "<<UNSAFE>>";

/// Zhipu error code for "input or output contains unsafe or sensitive content".
const SENSITIVE_ERROR_CODE: &str = "1301";

/// Zhipu error code for an exhausted balance. Arrives as a 429 but waiting
/// does not help.
const BALANCE_ERROR_CODE: &str = "1113";

const MAX_THROTTLED_RETRIES: u32 = 3;
const MAX_SERVER_RETRIES: u32 = 2;

const SINGLE_PROMPT: &str = "You translate manga dialogue. Output only the translation, nothing else.";

const BATCH_PROMPT: &str = "You translate manga dialogue. The input is a JSON object with target \
language \"l\" and an array of lines \"t\". Output exactly one translated line per input line, \
in the same order, separated by newlines, with no numbering and no commentary. If you cannot \
translate a line for content reasons, output <<UNSAFE>> on that line instead.";

pub struct ZhipuBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    batch_size: usize,
    /// Token bucket: next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
}

impl ZhipuBackend {
    pub fn new(settings: &ZhipuSettings) -> Result<Self, TranslateError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| TranslateError::InvalidInput("Zhipu API key not configured".into()))?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            batch_size: settings.batch_size.max(1),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(settings.min_interval_ms),
        })
    }

    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, TranslateError> {
        self.rate_limit_wait().await;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": 0.1,
            "stream": false
        });

        let response = self.send_with_retry(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        parse_completion(&text)
    }

    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TranslateError> {
        let mut policy = RetryPolicy::default();
        loop {
            let sent = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let wait = match sent {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = retry_after(resp.headers());
                    let text = resp.text().await.unwrap_or_default();
                    policy.after_status(status, retry_after, &text)?
                }
                Err(e) if e.is_timeout() => policy.after_timeout()?,
                Err(e) => return Err(TranslateError::ApiError(e.to_string())),
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Retry decisions for one request.
/// 429: Retry-After or 1s/2s/4s (max 3), except code 1113.
/// 5xx: 500ms/1s (max 2). Timeout: immediate retry once.
/// Any other status fails at once; code 1301 is a content rejection.
#[derive(Debug, Default)]
struct RetryPolicy {
    throttled: u32,
    server_errors: u32,
    timed_out: bool,
}

impl RetryPolicy {
    /// How long to wait before the next attempt, or the error to give up with.
    fn after_status(
        &mut self,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Result<Duration, TranslateError> {
        let code = error_code(body);
        match status {
            429 if code.as_deref() == Some(BALANCE_ERROR_CODE) => Err(TranslateError::ApiError(
                format!("account balance exhausted (code {BALANCE_ERROR_CODE})"),
            )),
            429 => {
                if self.throttled >= MAX_THROTTLED_RETRIES {
                    return Err(TranslateError::RateLimited {
                        retry_after_ms: retry_after.map_or(0, |d| d.as_millis() as u64),
                    });
                }
                let wait = retry_after.unwrap_or_else(|| Duration::from_secs(1 << self.throttled));
                warn!(
                    attempt = self.throttled,
                    wait_ms = wait.as_millis() as u64,
                    "zhipu throttled, retrying"
                );
                self.throttled += 1;
                Ok(wait)
            }
            500..=599 => {
                if self.server_errors >= MAX_SERVER_RETRIES {
                    return Err(TranslateError::ApiError(format!("server error: {status}")));
                }
                let wait = Duration::from_millis(500 << self.server_errors);
                warn!(
                    attempt = self.server_errors,
                    status,
                    wait_ms = wait.as_millis() as u64,
                    "zhipu server error, retrying"
                );
                self.server_errors += 1;
                Ok(wait)
            }
            _ if code.as_deref() == Some(SENSITIVE_ERROR_CODE) => Err(TranslateError::ContentRejected(
                format!("status {status}, code {SENSITIVE_ERROR_CODE}"),
            )),
            _ => Err(TranslateError::ApiError(format!(
                "unexpected status {status}: {}",
                body.chars().take(200).collect::<String>()
            ))),
        }
    }

    fn after_timeout(&mut self) -> Result<Duration, TranslateError> {
        if self.timed_out {
            return Err(TranslateError::Timeout);
        }
        warn!("zhipu request timed out, retrying once");
        self.timed_out = true;
        Ok(Duration::ZERO)
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl TranslatorBackend for ZhipuBackend {
    fn id(&self) -> BackendKind {
        BackendKind::Zhipu
    }

    async fn translate_text(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        let user = serde_json::json!({ "t": text, "l": target_lang }).to_string();
        let reply = self.complete(SINGLE_PROMPT, user).await?;
        let reply = reply.trim();
        if reply == UNSAFE_MARKER {
            return Err(TranslateError::ContentRejected("unsafe marker".into()));
        }
        Ok(reply.to_string())
    }

    fn batch_size(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        target_lang: &str,
    ) -> Result<Vec<LineOutcome>, TranslateError> {
        let user = serde_json::json!({ "t": lines, "l": target_lang }).to_string();
        let reply = self.complete(BATCH_PROMPT, user).await?;
        let outcomes = split_batch_reply(&reply);
        debug!(sent = lines.len(), received = outcomes.len(), "zhipu batch reply");
        Ok(outcomes)
    }
}

// --- Response handling ---

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: serde_json::Value,
}

fn parse_completion(body: &str) -> Result<String, TranslateError> {
    let parsed: Completion = serde_json::from_str(body)
        .map_err(|e| TranslateError::MalformedResponse(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TranslateError::MalformedResponse("no choices".into()))?;
    if choice.finish_reason.as_deref() == Some("sensitive") {
        return Err(TranslateError::ContentRejected("finish_reason=sensitive".into()));
    }
    choice
        .message
        .content
        .ok_or_else(|| TranslateError::MalformedResponse("empty message".into()))
}

/// `error.code` of a Zhipu error body; sent as a string or a number.
fn error_code(body: &str) -> Option<String> {
    match serde_json::from_str::<ErrorBody>(body).ok()?.error.code {
        serde_json::Value::String(code) => Some(code),
        serde_json::Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

/// One outcome per non-empty reply line. Blank lines are layout noise from the
/// model, not translations, so they are skipped before the count is compared.
fn split_batch_reply(reply: &str) -> Vec<LineOutcome> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            if l == UNSAFE_MARKER {
                LineOutcome::Rejected
            } else {
                LineOutcome::Translated(l.to_string())
            }
        })
        .collect()
}
