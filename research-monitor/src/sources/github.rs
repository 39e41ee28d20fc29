use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{truncate_chars, SourceAdapter};
use crate::item::{Item, ItemSource};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const MAX_PER_PAGE: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 2000;

/// Repositories from the GitHub search API, one query per topic.
pub struct GithubSource {
    api_url: String,
    token: Option<String>,
    topics: Vec<String>,
    min_stars: u32,
    max_items: Option<usize>,
    client: Client,
}

impl GithubSource {
    pub fn new(client: Client, api_url: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
            topics,
            min_stars: 0,
            max_items: None,
            client,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_min_stars(mut self, min_stars: u32) -> Self {
        self.min_stars = min_stars;
        self
    }

    /// Per-source cap, applied on top of the caller's limit
    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    fn search_query(&self, topic: &str, since: DateTime<Utc>) -> String {
        let mut q = format!("topic:{} pushed:>={}", topic, since.format("%Y-%m-%d"));
        if self.min_stars > 0 {
            q.push_str(&format!(" stars:>={}", self.min_stars));
        }
        q
    }

    async fn search(&self, topic: &str, since: DateTime<Utc>, per_page: usize) -> Result<Vec<Repository>> {
        let url = format!("{}/search/repositories", self.api_url);
        let query = self.search_query(topic, since);
        let per_page = per_page.to_string();

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .query(&[
                ("q", query.as_str()),
                ("sort", "stars"),
                ("order", "desc"),
                ("per_page", per_page.as_str()),
            ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("network error during GitHub search")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub search for topic '{}' failed with status {}: {}", topic, status, truncate_chars(&body, 200));
        }
        let results: SearchResponse = response.json().await.context("failed to parse GitHub search response")?;
        debug!(topic, total = results.total_count, returned = results.items.len(), "github: search results");
        Ok(results.items)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for GithubSource {
    fn source(&self) -> ItemSource {
        ItemSource::Github
    }

    async fn fetch(&self, max_items: usize, since: DateTime<Utc>) -> Result<Vec<Item>> {
        let limit = self.max_items.map_or(max_items, |cap| cap.min(max_items));
        if self.topics.is_empty() {
            warn!("github: no topics configured, nothing to search");
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut failures = 0;
        for topic in &self.topics {
            if items.len() >= limit {
                break;
            }
            let repos = match self.search(topic, since, limit.min(MAX_PER_PAGE)).await {
                Ok(repos) => repos,
                Err(e) => {
                    warn!(topic = %topic, error = %format!("{:#}", e), "github: topic search failed");
                    failures += 1;
                    continue;
                }
            };
            for repo in repos {
                if items.len() >= limit {
                    break;
                }
                if !seen.insert(repo.full_name.clone()) {
                    continue;
                }
                match repo.into_item() {
                    Ok(item) => items.push(item),
                    Err(e) => debug!(error = %e, "github: skipping repository"),
                }
            }
        }

        if failures == self.topics.len() {
            bail!("all {} GitHub topic searches failed", failures);
        }
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    items: Vec<Repository>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
    html_url: String,
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    pushed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Repository {
    fn into_item(self) -> Result<Item> {
        let description = self.description.unwrap_or_default();
        let summary = format!(
            "Description: {}\n\nTopics: {}",
            truncate_chars(description.trim(), MAX_DESCRIPTION_CHARS),
            self.topics.join(", ")
        );
        let published_at = self.pushed_at.or(self.updated_at).unwrap_or_else(Utc::now);
        let item = Item::new(
            ItemSource::Github,
            &self.full_name,
            self.full_name.clone(),
            self.html_url,
            summary,
            published_at,
        )?
        .with_metadata("stars", self.stargazers_count.to_string());
        Ok(match self.language {
            Some(lang) if !lang.is_empty() => item.with_metadata("language", lang),
            _ => item,
        })
    }
}
