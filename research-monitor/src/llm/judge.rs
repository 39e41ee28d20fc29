use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{extract_json_from_text, LlmError, LlmProvider, LlmRequest};
use crate::item::Item;
use crate::judge::{InterestProfile, JudgeError, RelevanceJudge, Verdict};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a research analyst. Analyze the provided item and determine \
its relevance to the given interests. Respond with a JSON object containing: score (float 0-1) and reason (string).";

pub const DEFAULT_USER_TEMPLATE: &str = r#"Analyze the following item for relevance:

INTERESTS:
{interests}

ITEM:
Title: {title}
Source: {source}
URL: {url}

Content:
{summary}

Determine if this item is relevant to the interests described above.

Respond with JSON:
{"score": 0.0-1.0, "reason": "Brief explanation"}"#;

/// Characters of item text sent to the model
pub(crate) const MAX_SUMMARY_CHARS: usize = 8000;

/// Relevance judge backed by an LLM provider.
///
/// Generation limits come from the provider's configured defaults.
pub struct LlmJudge {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    user_template: String,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }

    /// Replace the default prompts; `None` keeps the default.
    pub fn with_prompts(mut self, system: Option<String>, user_template: Option<String>) -> Self {
        if let Some(system) = system {
            self.system_prompt = system;
        }
        if let Some(template) = user_template {
            self.user_template = template;
        }
        self
    }

    pub fn render_prompt(&self, item: &Item, profile: &InterestProfile) -> String {
        let summary: String = item.summary.chars().take(MAX_SUMMARY_CHARS).collect();
        render_template(
            &self.user_template,
            &[
                ("interests", profile.as_str()),
                ("title", &item.title),
                ("source", item.source.tag()),
                ("url", &item.url),
                ("summary", &summary),
            ],
        )
    }
}

#[async_trait::async_trait]
impl RelevanceJudge for LlmJudge {
    async fn evaluate(&self, item: &Item, profile: &InterestProfile) -> Result<Verdict, JudgeError> {
        let request = LlmRequest {
            system: Some(self.system_prompt.clone()),
            prompt: self.render_prompt(item, profile),
            max_tokens: None,
            temperature: None,
            timeout_seconds: None,
        };

        let response = self.provider.generate(request).await.map_err(|e| match e {
            LlmError::RateLimited { retry_after } => JudgeError::RateLimited { retry_after },
            other => JudgeError::Failed(other.to_string()),
        })?;
        debug!(
            id = %item.id,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "judge: response received"
        );

        parse_verdict(&item.id, &response.content)
    }

    fn name(&self) -> &str {
        self.provider.model()
    }
}

#[derive(Debug, Deserialize)]
struct VerdictJson {
    #[serde(alias = "relevance_score")]
    score: f64,
    #[serde(default, alias = "rationale")]
    reason: String,
}

/// Parse the model reply into a verdict. Finite scores are clamped into [0, 1].
pub fn parse_verdict(item_id: &str, reply: &str) -> Result<Verdict, JudgeError> {
    let json = extract_json_from_text(reply)
        .ok_or_else(|| JudgeError::failed(format!("no JSON object in judge reply: {}", preview(reply))))?;
    let parsed: VerdictJson = serde_json::from_str(&json)
        .map_err(|e| JudgeError::failed(format!("malformed judge reply ({}): {}", e, preview(&json))))?;
    if !parsed.score.is_finite() {
        return Err(JudgeError::failed("judge returned a non-finite score"));
    }
    Ok(Verdict {
        item_id: item_id.to_string(),
        score: parsed.score.clamp(0.0, 1.0),
        rationale: parsed.reason.trim().to_string(),
    })
}

pub(crate) fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Substitute `{name}` placeholders in a single pass, so substituted text is never rescanned.
pub(crate) fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemSource;
    use crate::llm::{LlmResponse, UsageMetadata};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        last_prompt: Mutex<Option<LlmRequest>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            *self.last_prompt.lock().unwrap() = Some(request);
            let next = self.replies.lock().unwrap().remove(0)?;
            Ok(LlmResponse {
                content: next,
                usage: UsageMetadata::default(),
                model: "scripted".to_string(),
            })
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn sample_item() -> Item {
        Item::new(
            ItemSource::HfPapers,
            "2501.00001",
            "Fast Neural Vocoder",
            "https://huggingface.co/papers/2501.00001",
            "We present a vocoder.",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn parses_plain_and_fenced_replies() {
        let v = parse_verdict("x", r#"{"score": 0.83, "reason": " on topic "}"#).unwrap();
        assert_eq!(v.score, 0.83);
        assert_eq!(v.rationale, "on topic");
        assert_eq!(v.item_id, "x");

        let v = parse_verdict("x", "```json\n{\"relevance_score\": 0.4, \"rationale\": \"meh\"}\n```").unwrap();
        assert_eq!(v.score, 0.4);
        assert_eq!(v.rationale, "meh");
    }

    #[test]
    fn clamps_out_of_range_scores() {
        assert_eq!(parse_verdict("x", r#"{"score": 1.7}"#).unwrap().score, 1.0);
        assert_eq!(parse_verdict("x", r#"{"score": -0.2}"#).unwrap().score, 0.0);
    }

    #[test]
    fn malformed_replies_are_judge_errors() {
        assert!(matches!(parse_verdict("x", "I think it is relevant"), Err(JudgeError::Failed(_))));
        assert!(matches!(parse_verdict("x", r#"{"reason": "no score"}"#), Err(JudgeError::Failed(_))));
        assert!(matches!(parse_verdict("x", r#"{"score": "high"}"#), Err(JudgeError::Failed(_))));
    }

    #[test]
    fn template_substitutes_once() {
        let out = render_template(
            "{title} / {interests} / {unknown} / {",
            &[("title", "{interests}"), ("interests", "tts")],
        );
        assert_eq!(out, "{interests} / tts / {unknown} / {");
    }

    #[test]
    fn prompt_contains_item_and_interests() {
        let judge = LlmJudge::new(Arc::new(ScriptedProvider::new(vec![])));
        let prompt = judge.render_prompt(&sample_item(), &InterestProfile::new("speech synthesis"));
        assert!(prompt.contains("speech synthesis"));
        assert!(prompt.contains("Title: Fast Neural Vocoder"));
        assert!(prompt.contains("Source: hf_papers"));
        assert!(prompt.contains("We present a vocoder."));
    }

    #[test]
    fn prompt_truncates_long_summaries() {
        let judge = LlmJudge::new(Arc::new(ScriptedProvider::new(vec![])))
            .with_prompts(None, Some("{summary}".to_string()));
        let mut item = sample_item();
        item.summary = "a".repeat(MAX_SUMMARY_CHARS + 500);
        assert_eq!(judge.render_prompt(&item, &InterestProfile::new("x")).len(), MAX_SUMMARY_CHARS);
    }

    #[tokio::test]
    async fn maps_provider_errors() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            Err(LlmError::Api {
                status: 400,
                body: "bad request".to_string(),
            }),
            Ok(r#"{"score": 0.9, "reason": "vocoders"}"#.to_string()),
        ]));
        let judge = LlmJudge::new(provider.clone()).with_prompts(Some("custom system".to_string()), None);
        let item = sample_item();
        let profile = InterestProfile::new("tts");

        assert_eq!(
            judge.evaluate(&item, &profile).await,
            Err(JudgeError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        match judge.evaluate(&item, &profile).await {
            Err(JudgeError::Failed(msg)) => assert!(msg.contains("400")),
            other => panic!("expected judge failure, got {:?}", other),
        }
        let verdict = judge.evaluate(&item, &profile).await.unwrap();
        assert_eq!(verdict.item_id, "hf_papers:2501.00001");
        assert_eq!(verdict.score, 0.9);

        let last = provider.last_prompt.lock().unwrap().clone().unwrap();
        assert_eq!(last.system.as_deref(), Some("custom system"));
        assert_eq!(last.max_tokens, None);
        assert_eq!(last.temperature, None);
    }
}
