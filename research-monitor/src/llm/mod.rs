use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod anthropic;
pub mod enrich;
pub mod judge;
pub mod remote;

/// Core trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Model identifier, for logs
    fn model(&self) -> &str;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),
}

/// Statuses that mean "slow down": 429 Too Many Requests and 529 Overloaded.
pub fn is_rate_limit_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529
}

/// Read a `Retry-After` header given either as delta-seconds or as an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    parse_retry_after_value(raw, Utc::now())
}

/// Longest wait a provider hint can impose
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

fn parse_retry_after_value(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        return Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok();
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_RETRY_AFTER))
}

/// Map a non-success HTTP response to the matching error variant.
pub(crate) async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status();
    if is_rate_limit_status(status) {
        let retry_after = parse_retry_after(response.headers());
        return LlmError::RateLimited { retry_after };
    }
    let body = response.text().await.unwrap_or_default();
    LlmError::Api {
        status: status.as_u16(),
        body,
    }
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_huge_values_are_capped() {
        let now = Utc::now();
        assert_eq!(parse_retry_after_value("1e30", now), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after_value("99999999999999999999999", now), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after_value("inf", now), None);
        assert_eq!(parse_retry_after_value("-3", now), None);
        assert_eq!(
            parse_retry_after_value("Fri, 01 Jan 2100 00:00:00 GMT", now),
            Some(MAX_RETRY_AFTER)
        );

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after_value("Wed, 21 Oct 2026 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        // A date in the past means "now"
        assert_eq!(
            parse_retry_after_value("Wed, 21 Oct 2026 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn rate_limit_statuses() {
        assert!(is_rate_limit_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_rate_limit_status(reqwest::StatusCode::from_u16(529).unwrap()));
        assert!(!is_rate_limit_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn extracts_json_from_fenced_and_bare_text() {
        let fenced = "Here you go:\n```json\n{\"score\": 0.8}\n```";
        assert_eq!(extract_json_from_text(fenced).as_deref(), Some("{\"score\": 0.8}"));

        let bare = "Sure. {\"score\": 0.1, \"reason\": \"off topic\"} Hope this helps";
        assert_eq!(
            extract_json_from_text(bare).as_deref(),
            Some("{\"score\": 0.1, \"reason\": \"off topic\"}")
        );

        assert_eq!(extract_json_from_text("no json here"), None);
    }
}
