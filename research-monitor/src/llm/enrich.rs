use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::judge::{preview, render_template, MAX_SUMMARY_CHARS};
use super::{extract_json_from_text, LlmError, LlmProvider, LlmRequest};
use crate::digest::{DigestEntry, Enrichment};
use crate::executor::{CancelBatch, JudgeCall, RateLimitedBatchExecutor};
use crate::item::Item;
use crate::judge::JudgeError;
use crate::pipeline::ScoredItem;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a technical writer. Summarize research items concisely and extract their key points.";

pub const DEFAULT_USER_TEMPLATE: &str = r#"Content to summarize:

Title: {title}
Source: {source}
URL: {url}

Content:
{summary}

Write a brief, informative summary (2-4 sentences) focusing on key technical contributions
and practical applications, then extract 3-5 key highlights (innovations, applications,
performance improvements, novel approaches).

Respond with JSON:
{"summary": "...", "highlights": ["...", "..."]}"#;

/// Writes a summary and highlights for a kept item.
pub struct LlmEnricher {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    user_template: String,
    max_highlights: usize,
}

impl LlmEnricher {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            max_highlights: 5,
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

    pub fn with_max_highlights(mut self, max_highlights: usize) -> Self {
        self.max_highlights = max_highlights;
        self
    }

    pub fn render_prompt(&self, item: &Item) -> String {
        let summary: String = item.summary.chars().take(MAX_SUMMARY_CHARS).collect();
        render_template(
            &self.user_template,
            &[
                ("title", &item.title),
                ("source", item.source.tag()),
                ("url", &item.url),
                ("summary", &summary),
            ],
        )
    }

    /// One LLM call. Rate limits surface as `JudgeError::RateLimited` so the executor retries them.
    pub async fn enrich(&self, item: &Item) -> Result<Enrichment, JudgeError> {
        let request = LlmRequest {
            system: Some(self.system_prompt.clone()),
            prompt: self.render_prompt(item),
            ..Default::default()
        };
        let response = self.provider.generate(request).await.map_err(|e| match e {
            LlmError::RateLimited { retry_after } => JudgeError::RateLimited { retry_after },
            other => JudgeError::Failed(other.to_string()),
        })?;
        debug!(
            id = %item.id,
            completion_tokens = response.usage.completion_tokens,
            "enrich: response received"
        );
        parse_enrichment(&response.content, self.max_highlights)
    }
}

#[derive(Debug, Deserialize)]
struct EnrichmentJson {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    highlights: Vec<String>,
}

/// Parse the model reply. A reply that is not the expected JSON is kept whole as the summary.
pub fn parse_enrichment(reply: &str, max_highlights: usize) -> Result<Enrichment, JudgeError> {
    let parsed = extract_json_from_text(reply).and_then(|json| serde_json::from_str::<EnrichmentJson>(&json).ok());
    let enrichment = match parsed {
        Some(parsed) => Enrichment {
            summary: parsed.summary.trim().to_string(),
            highlights: parsed
                .highlights
                .iter()
                .map(|h| h.trim().trim_start_matches("- ").trim().to_string())
                .filter(|h| !h.is_empty())
                .take(max_highlights)
                .collect(),
        },
        None => Enrichment {
            summary: reply.trim().to_string(),
            highlights: Vec::new(),
        },
    };
    if enrichment.summary.is_empty() && enrichment.highlights.is_empty() {
        return Err(JudgeError::failed(format!("empty enrichment reply: {}", preview(reply))));
    }
    Ok(enrichment)
}

/// Enrich every kept item through `executor`. Items whose enrichment fails keep
/// their entry without it.
pub async fn enrich_entries(
    enricher: Arc<LlmEnricher>,
    executor: &RateLimitedBatchExecutor,
    kept: Vec<ScoredItem>,
    cancel: &CancelBatch,
) -> Vec<DigestEntry> {
    info!(items = kept.len(), "enrich: writing summaries");
    let calls: Vec<JudgeCall<Enrichment>> = kept
        .iter()
        .map(|scored| {
            let enricher = enricher.clone();
            let item = Arc::new(scored.item.clone());
            JudgeCall::new(scored.item.id.clone(), move || {
                let enricher = enricher.clone();
                let item = item.clone();
                async move { enricher.enrich(&item).await }
            })
        })
        .collect();

    let outcomes = executor.run_all(calls, cancel).await;
    let mut failed = 0;
    let entries: Vec<DigestEntry> = kept
        .into_iter()
        .zip(outcomes)
        .map(|(scored, outcome)| {
            let mut entry = DigestEntry::from(scored);
            match outcome.result {
                Ok(enrichment) => entry.enrichment = Some(enrichment),
                Err(error) => {
                    failed += 1;
                    warn!(id = %entry.item.id, error = %error, "enrich: falling back to rationale");
                }
            }
            entry
        })
        .collect();
    info!(enriched = entries.len() - failed, failed, "enrich: finished");
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::item::ItemSource;
    use crate::judge::Verdict;
    use crate::llm::{LlmResponse, UsageMetadata};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt);
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

    fn scored(id: &str, score: f64) -> ScoredItem {
        let item = Item::new(
            ItemSource::HfPapers,
            id,
            format!("Paper {}", id),
            format!("https://huggingface.co/papers/{}", id),
            "abstract text",
            Utc::now(),
        )
        .unwrap();
        ScoredItem {
            verdict: Verdict {
                item_id: item.id.clone(),
                score,
                rationale: "on topic".to_string(),
            },
            item,
            attempts: 1,
        }
    }

    #[test]
    fn parses_json_reply() {
        let reply = "```json\n{\"summary\": \" A new vocoder. \", \"highlights\": [\"- fast\", \"\", \"small\", \"open\"]}\n```";
        let enrichment = parse_enrichment(reply, 2).unwrap();
        assert_eq!(enrichment.summary, "A new vocoder.");
        assert_eq!(enrichment.highlights, vec!["fast".to_string(), "small".to_string()]);
    }

    #[test]
    fn plain_text_reply_becomes_summary() {
        let enrichment = parse_enrichment("Just a paragraph about TTS.", 5).unwrap();
        assert_eq!(enrichment.summary, "Just a paragraph about TTS.");
        assert!(enrichment.highlights.is_empty());

        assert!(matches!(parse_enrichment("   ", 5), Err(JudgeError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn enriches_in_order_and_falls_back_per_item() {
        let provider = Arc::new(ScriptedProvider {
            replies: Mutex::new(vec![
                Ok(r#"{"summary": "first", "highlights": ["a"]}"#.to_string()),
                Err(LlmError::Api {
                    status: 500,
                    body: "boom".to_string(),
                }),
                Err(LlmError::RateLimited {
                    retry_after: Some(Duration::from_secs(1)),
                }),
                Ok(r#"{"summary": "third"}"#.to_string()),
            ]),
            prompts: Mutex::new(Vec::new()),
        });
        let enricher = Arc::new(LlmEnricher::new(provider.clone()));
        let executor = RateLimitedBatchExecutor::new(ExecutorConfig {
            concurrency: 1,
            min_request_spacing: Duration::from_millis(100),
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(500),
            call_timeout: None,
        });

        let kept = vec![scored("1", 0.9), scored("2", 0.8), scored("3", 0.7)];
        let entries = enrich_entries(enricher, &executor, kept, &CancelBatch::new()).await;

        let ids: Vec<_> = entries.iter().map(|e| e.item.id.as_str()).collect();
        assert_eq!(ids, vec!["hf_papers:1", "hf_papers:2", "hf_papers:3"]);
        assert_eq!(entries[0].enrichment.as_ref().map(|e| e.summary.as_str()), Some("first"));
        assert!(entries[1].enrichment.is_none());
        assert_eq!(entries[2].enrichment.as_ref().map(|e| e.summary.as_str()), Some("third"));
        assert_eq!(entries[2].verdict.score, 0.7);

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[0].contains("Title: Paper 1"));
        assert!(prompts[0].contains("abstract text"));
    }

    #[tokio::test]
    async fn cancelled_batch_keeps_entries_without_enrichment() {
        let provider = Arc::new(ScriptedProvider {
            replies: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        });
        let cancel = CancelBatch::new();
        cancel.cancel();
        let entries = enrich_entries(
            Arc::new(LlmEnricher::new(provider.clone())),
            &RateLimitedBatchExecutor::new(ExecutorConfig::default()),
            vec![scored("1", 0.9)],
            &cancel,
        )
        .await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].enrichment.is_none());
        assert!(provider.prompts.lock().unwrap().is_empty());
    }
}
