use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::item::{dedup_by_id, Item, ItemSource};

pub mod github;
pub mod hf_papers;
pub mod hf_trending;

pub use github::GithubSource;
pub use hf_papers::HfPapersSource;
pub use hf_trending::HfTrendingSource;

/// Public Hugging Face site, used for item links
pub const HF_SITE_URL: &str = "https://huggingface.co";

const USER_AGENT: &str = concat!("research-monitor/", env!("CARGO_PKG_VERSION"));

/// A place candidate items come from.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> ItemSource;

    /// Fetch at most `max_items` items published or updated since `since`.
    async fn fetch(&self, max_items: usize, since: DateTime<Utc>) -> Result<Vec<Item>>;
}

/// Shared HTTP client for source adapters.
pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build reqwest client")
}

/// Case-insensitive keyword match over title and text. No keywords matches everything.
pub fn matches_keywords(title: &str, text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let haystack = format!("{} {}", title, text).to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .any(|k| haystack.contains(&k.trim().to_lowercase()))
}

/// Fetch every source in turn. A failing source is logged and skipped.
pub async fn collect_items(sources: &[Box<dyn SourceAdapter>], max_items: usize, since: DateTime<Utc>) -> Vec<Item> {
    let mut all = Vec::new();
    for source in sources {
        let tag = source.source();
        match source.fetch(max_items, since).await {
            Ok(items) => {
                info!(source = %tag, count = items.len(), "sources: fetched items");
                all.extend(items);
            }
            Err(e) => {
                warn!(source = %tag, error = %format!("{:#}", e), "sources: fetch failed, skipping source");
            }
        }
    }
    let before = all.len();
    let items = dedup_by_id(all);
    if items.len() < before {
        info!(dropped = before - items.len(), "sources: removed duplicate items");
    }
    items
}

/// Cut text to at most `max_chars` characters.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Fixed {
        source: ItemSource,
        ids: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Fixed {
        fn source(&self) -> ItemSource {
            self.source
        }

        async fn fetch(&self, max_items: usize, _since: DateTime<Utc>) -> Result<Vec<Item>> {
            if self.fail {
                return Err(anyhow!("upstream unavailable"));
            }
            self.ids
                .iter()
                .take(max_items)
                .map(|id| Item::new(self.source, id, *id, format!("https://example.com/{}", id), "", Utc::now()))
                .collect()
        }
    }

    #[test]
    fn keyword_matching() {
        let kw = vec!["TTS".to_string(), "vocoder".to_string()];
        assert!(matches_keywords("Fast tts model", "", &kw));
        assert!(matches_keywords("A model", "with a neural VOCODER", &kw));
        assert!(!matches_keywords("Image segmentation", "masks", &kw));
        assert!(matches_keywords("anything", "", &[]));
    }

    #[tokio::test]
    async fn collect_skips_failing_sources_and_dedups() {
        let sources: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(Fixed {
                source: ItemSource::Github,
                ids: vec!["a/b", "c/d", "a/b"],
                fail: false,
            }),
            Box::new(Fixed {
                source: ItemSource::HfPapers,
                ids: vec!["1"],
                fail: true,
            }),
            Box::new(Fixed {
                source: ItemSource::HfTrending,
                ids: vec!["x/y", "z/w", "q/r"],
                fail: false,
            }),
        ];
        let items = collect_items(&sources, 2, Utc::now()).await;
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["github:a/b", "github:c/d", "hf_trending:x/y", "hf_trending:z/w"]);
    }

    #[test]
    fn truncation_is_char_based() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
