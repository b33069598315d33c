//! LLM Service — one endpoint + model + key, with retry/rate-limit/
//! availability state layered on top of a bare [`LlmProvider`] adapter.
//!
//! The adapter (e.g. [`crate::openai_compat::OpenAiCompatProvider`]) only
//! knows how to shape one HTTP request and decode one response. Everything
//! about *what to do when that call fails* — bounded retry, 429 backoff,
//! permanent-down marking, the one-shot `parallel_tool_calls` adaptation —
//! lives here, so the driver loop never has to know which provider it's
//! talking to.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use sa_domain::config::{ModelPricing, ProviderConfig};
use sa_domain::error::Error;

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// Retry-after-relevant headers captured at the HTTP boundary, before the
/// response body is consumed.
pub struct RateLimitHeaders {
    pub retry_after: Option<String>,
    pub rate_limit_reset: Option<String>,
}

pub fn capture_rate_limit_headers(headers: &HeaderMap) -> RateLimitHeaders {
    RateLimitHeaders {
        retry_after: headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        rate_limit_reset: headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

pub fn http_error(provider: &str, status: u16, headers: RateLimitHeaders, body: String) -> Error {
    Error::LlmHttp {
        provider: provider.to_string(),
        status,
        retry_after: headers.retry_after,
        rate_limit_reset: headers.rate_limit_reset,
        body,
    }
}

/// Unify the three retry-after sources a provider might give us: an explicit
/// `Retry-After` header, an `X-RateLimit-Reset` header, or the same reset
/// time buried in the error body's metadata.
///
/// `now_epoch_secs` is threaded through explicitly rather than read from the
/// clock inside this function, so the epoch/millisecond boundary math stays
/// a pure, table-testable function.
pub fn parse_retry_after_seconds(
    retry_after_header: Option<&str>,
    rate_limit_reset_header: Option<&str>,
    body: &serde_json::Value,
    now_epoch_secs: i64,
) -> u64 {
    if let Some(raw) = retry_after_header {
        if let Ok(v) = raw.trim().parse::<u64>() {
            return if v == 0 { 1 } else { v };
        }
    }

    let reset_raw = rate_limit_reset_header.map(str::to_string).or_else(|| {
        body.get("error")
            .and_then(|e| e.get("metadata"))
            .and_then(|m| m.get("headers"))
            .and_then(|h| h.get("X-RateLimit-Reset"))
            .and_then(|v| {
                v.as_str()
                    .map(str::to_string)
                    .or_else(|| v.as_i64().map(|n| n.to_string()))
            })
    });

    if let Some(raw) = reset_raw {
        if let Ok(mut epoch) = raw.trim().parse::<i64>() {
            if epoch > 2_000_000_000 {
                epoch /= 1000; // epoch milliseconds -> seconds
            }
            let delta = (epoch - now_epoch_secs).max(0);
            return (delta + 1) as u64;
        }
    }

    1
}

/// Body markers for the one-shot `parallel_tool_calls` adaptation: a 4xx
/// whose body complains about parallel tool calls, or an otherwise-opaque
/// 400 upstream error worth one blind retry with the flag disabled.
fn is_adaptive_4xx(status: u16, body: &str) -> bool {
    if !(400..500).contains(&status) {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("parallel_tool_calls")
        || lower.contains("parallel tool calls")
        || (status == 400
            && (lower.contains("upstream_error") || lower.contains("provider returned error")))
}

fn is_rate_limited(status: u16, body: &str) -> bool {
    status == 429 || body.contains("\"code\":429") || body.contains("\"code\": 429")
}

/// Outcome of one [`LlmService::call`] — the per-HTTP-attempt classification.
/// Model switches, tool-requested exits, iteration limits, and cost
/// exhaustion are driver-level terminal reasons built on top of this, not
/// part of this type.
#[derive(Debug)]
pub enum LlmCallOutcome {
    Success(ChatResponse),
    RateLimited { retry_after_secs: u64 },
    /// Non-permanent failure; the orchestrator may retry with another model.
    Failed { message: String },
    /// 401/403 — this service must never be retried again in this process.
    PermanentlyDown,
}

pub struct LlmService {
    pub id: String,
    pub model: String,
    provider: std::sync::Arc<dyn LlmProvider>,
    pricing: Option<ModelPricing>,
    temperature: Option<f32>,
    context_length: Option<u32>,
    strengths: RwLock<String>,
    weaknesses: RwLock<String>,
    parallel_tool_calls_enabled: AtomicBool,
    permanently_down: AtomicBool,
    /// Epoch seconds before which this service should not be called again.
    available_at: AtomicI64,
    has_succeeded: AtomicBool,
}

impl LlmService {
    pub fn new(
        id: String,
        model: String,
        provider: std::sync::Arc<dyn LlmProvider>,
        pricing: Option<ModelPricing>,
        cfg: &ProviderConfig,
    ) -> Self {
        Self {
            id,
            model,
            provider,
            pricing,
            temperature: cfg.temperature,
            context_length: cfg.context_length,
            strengths: RwLock::new(cfg.strengths.clone()),
            weaknesses: RwLock::new(cfg.weaknesses.clone()),
            parallel_tool_calls_enabled: AtomicBool::new(!cfg.disable_parallel_tool_calls),
            permanently_down: AtomicBool::new(false),
            available_at: AtomicI64::new(0),
            has_succeeded: AtomicBool::new(false),
        }
    }

    pub fn cost_per_1m(&self) -> f64 {
        self.pricing
            .map(|p| p.input_per_1m + p.output_per_1m)
            .unwrap_or(0.0)
    }

    pub fn context_length(&self) -> Option<u32> {
        self.context_length
    }

    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        self.pricing
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    pub fn strengths(&self) -> String {
        self.strengths.read().clone()
    }

    pub fn weaknesses(&self) -> String {
        self.weaknesses.read().clone()
    }

    pub fn update_notes(&self, strengths: Option<String>, weaknesses: Option<String>) {
        if let Some(s) = strengths {
            *self.strengths.write() = s;
        }
        if let Some(w) = weaknesses {
            *self.weaknesses.write() = w;
        }
    }

    /// Available when not permanently marked down and any rate-limit or
    /// failure cooldown has elapsed.
    pub fn is_available(&self) -> bool {
        !self.permanently_down.load(Ordering::SeqCst)
            && Utc::now().timestamp() >= self.available_at.load(Ordering::SeqCst)
    }

    pub fn is_permanently_down(&self) -> bool {
        self.permanently_down.load(Ordering::SeqCst)
    }

    /// Seconds until this service becomes available again; 0 if already available.
    pub fn seconds_until_available(&self) -> i64 {
        (self.available_at.load(Ordering::SeqCst) - Utc::now().timestamp()).max(0)
    }

    fn mark_rate_limited(&self, retry_after_secs: u64) {
        self.available_at
            .store(Utc::now().timestamp() + retry_after_secs as i64, Ordering::SeqCst);
    }

    /// 5xx/transport exhaustion: 5 minute cooldown, not a permanent mark.
    fn mark_temporarily_down(&self) {
        self.available_at.store(Utc::now().timestamp() + 300, Ordering::SeqCst);
    }

    fn mark_permanently_down(&self) {
        self.permanently_down.store(true, Ordering::SeqCst);
    }

    /// Run one provider call with bounded retry, 429 classification, auth
    /// permanence, and the one-shot `parallel_tool_calls` adaptation.
    pub async fn call(&self, mut req: ChatRequest) -> LlmCallOutcome {
        req.model = Some(self.model.clone());
        if req.temperature.is_none() {
            req.temperature = self.temperature;
        }

        let attempts_allowed: u32 = if self.has_succeeded.load(Ordering::SeqCst) { 3 } else { 1 };
        let mut adapted_once = false;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let parallel = self.parallel_tool_calls_enabled.load(Ordering::SeqCst);
            let this_req = ChatRequest {
                messages: req.messages.clone(),
                tools: req.tools.clone(),
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                json_mode: req.json_mode,
                model: req.model.clone(),
                parallel_tool_calls: Some(parallel),
                top_p: req.top_p,
                frequency_penalty: req.frequency_penalty,
                seed: req.seed,
            };

            match self.provider.chat(this_req).await {
                Ok(resp) => {
                    self.has_succeeded.store(true, Ordering::SeqCst);
                    return LlmCallOutcome::Success(resp);
                }
                Err(Error::LlmHttp {
                    status,
                    retry_after,
                    rate_limit_reset,
                    body,
                    ..
                }) => {
                    if status == 401 || status == 403 {
                        self.mark_permanently_down();
                        return LlmCallOutcome::PermanentlyDown;
                    }

                    if is_rate_limited(status, &body) {
                        let body_json: serde_json::Value =
                            serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
                        let secs = parse_retry_after_seconds(
                            retry_after.as_deref(),
                            rate_limit_reset.as_deref(),
                            &body_json,
                            Utc::now().timestamp(),
                        );
                        self.mark_rate_limited(secs);
                        return LlmCallOutcome::RateLimited { retry_after_secs: secs };
                    }

                    if !adapted_once
                        && is_adaptive_4xx(status, &body)
                        && self.parallel_tool_calls_enabled.swap(false, Ordering::SeqCst)
                    {
                        adapted_once = true;
                        continue;
                    }

                    if (500..600).contains(&status) {
                        if attempt < attempts_allowed {
                            let delay = Duration::from_secs((3 * attempt as u64).min(15));
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        self.mark_temporarily_down();
                        return LlmCallOutcome::Failed {
                            message: format!("HTTP {status}: {body}"),
                        };
                    }

                    // 4xx, non-adaptive, non-rate-limit: not permanent.
                    return LlmCallOutcome::Failed {
                        message: format!("HTTP {status}: {body}"),
                    };
                }
                Err(other) => {
                    // Transport-level failure (connect/timeout/decode): treat
                    // like a 5xx for retry purposes.
                    if attempt < attempts_allowed {
                        let delay = Duration::from_secs((3 * attempt as u64).min(15));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.mark_temporarily_down();
                    return LlmCallOutcome::Failed { message: other.to_string() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_zero_parses_as_one_second() {
        let body = serde_json::Value::Null;
        let secs = parse_retry_after_seconds(Some("0"), None, &body, 1_700_000_000);
        assert_eq!(secs, 1);
    }

    #[test]
    fn retry_after_header_takes_precedence() {
        let body = serde_json::Value::Null;
        let secs = parse_retry_after_seconds(Some("30"), Some("9999999999"), &body, 1_700_000_000);
        assert_eq!(secs, 30);
    }

    #[test]
    fn rate_limit_reset_milliseconds_converted_to_seconds_from_now() {
        let body = serde_json::Value::Null;
        // 1735689600000 ms == 1735689600 s, a fixed point far in the future
        // relative to `now`, so the delta is large and positive.
        let secs = parse_retry_after_seconds(None, Some("1735689600000"), &body, 1_700_000_000);
        assert!(secs > 0);
        assert_eq!(secs, (1_735_689_600 - 1_700_000_000) + 1);
    }

    #[test]
    fn rate_limit_reset_in_the_past_clamps_to_one_second() {
        let body = serde_json::Value::Null;
        let secs = parse_retry_after_seconds(None, Some("1000"), &body, 1_700_000_000);
        assert_eq!(secs, 1);
    }

    #[test]
    fn rate_limit_reset_from_json_metadata() {
        let body = serde_json::json!({
            "error": { "metadata": { "headers": { "X-RateLimit-Reset": "1700000100" } } }
        });
        let secs = parse_retry_after_seconds(None, None, &body, 1_700_000_000);
        assert_eq!(secs, 101);
    }

    #[test]
    fn no_source_defaults_to_one_second() {
        let body = serde_json::Value::Null;
        let secs = parse_retry_after_seconds(None, None, &body, 1_700_000_000);
        assert_eq!(secs, 1);
    }

    #[test]
    fn adaptive_4xx_detects_parallel_tool_calls_body() {
        assert!(is_adaptive_4xx(400, "parallel_tool_calls is not supported"));
        assert!(is_adaptive_4xx(400, "Parallel tool calls are unsupported"));
        assert!(is_adaptive_4xx(400, "upstream_error: provider returned error"));
        assert!(!is_adaptive_4xx(400, "invalid api key"));
        assert!(!is_adaptive_4xx(500, "parallel_tool_calls"));
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limited(429, ""));
        assert!(is_rate_limited(400, "{\"code\":429,\"message\":\"slow down\"}"));
        assert!(!is_rate_limited(400, "{\"code\":400}"));
    }
}
