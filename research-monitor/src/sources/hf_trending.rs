use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{SourceAdapter, HF_SITE_URL};
use crate::item::{Item, ItemSource};

pub const DEFAULT_API_URL: &str = "https://huggingface.co";
pub const DEFAULT_PIPELINE_TAG: &str = "text-to-speech";
pub const DEFAULT_MAX_DAYS_OLD: i64 = 14;
/// Models requested per call, before date filtering
const FETCH_LIMIT: usize = 100;

/// Trending Hugging Face models for one pipeline tag.
pub struct HfTrendingSource {
    api_url: String,
    pipeline_tag: String,
    max_days_old: Option<i64>,
    max_items: Option<usize>,
    client: Client,
}

impl HfTrendingSource {
    pub fn new(client: Client, api_url: impl Into<String>, pipeline_tag: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            pipeline_tag: pipeline_tag.into(),
            max_days_old: Some(DEFAULT_MAX_DAYS_OLD),
            max_items: None,
            client,
        }
    }

    /// `None` falls back to the caller's `since`
    pub fn with_max_days_old(mut self, days: Option<i64>) -> Self {
        self.max_days_old = days;
        self
    }

    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    fn cutoff(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.max_days_old {
            Some(days) => now - ChronoDuration::days(days.max(0)),
            None => since,
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for HfTrendingSource {
    fn source(&self) -> ItemSource {
        ItemSource::HfTrending
    }

    async fn fetch(&self, max_items: usize, since: DateTime<Utc>) -> Result<Vec<Item>> {
        let limit = self.max_items.map_or(max_items, |cap| cap.min(max_items));
        let url = format!("{}/api/models", self.api_url);
        let fetch_limit = FETCH_LIMIT.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("pipeline_tag", self.pipeline_tag.as_str()),
                ("limit", fetch_limit.as_str()),
                ("full", "true"),
            ])
            .send()
            .await
            .context("network error during models fetch")?;
        let status = response.status();
        if !status.is_success() {
            bail!("models listing for '{}' failed with status {}", self.pipeline_tag, status);
        }
        let models: Vec<Model> = response.json().await.context("failed to parse models listing")?;

        let cutoff = self.cutoff(since, Utc::now());
        let selected = select_trending(models, cutoff, limit);
        info!(
            pipeline_tag = %self.pipeline_tag,
            kept = selected.kept.len(),
            stale = selected.stale,
            "hf_trending: models selected"
        );

        let mut items = Vec::with_capacity(selected.kept.len());
        for model in selected.kept {
            match model.into_item(&self.pipeline_tag) {
                Ok(item) => items.push(item),
                Err(e) => debug!(error = %e, "hf_trending: skipping model"),
            }
        }
        Ok(items)
    }
}

struct Selection {
    kept: Vec<Model>,
    stale: usize,
}

/// Highest trending score first; drop models last modified before `cutoff`.
/// Models without a modification date are kept.
fn select_trending(mut models: Vec<Model>, cutoff: DateTime<Utc>, limit: usize) -> Selection {
    models.retain(|m| m.resolved_id().is_some());
    models.sort_by(|a, b| {
        b.trending_score
            .unwrap_or(0.0)
            .total_cmp(&a.trending_score.unwrap_or(0.0))
    });
    let mut stale = 0;
    let kept = models
        .into_iter()
        .filter(|m| match m.last_modified {
            Some(modified) if modified < cutoff => {
                stale += 1;
                false
            }
            _ => true,
        })
        .take(limit)
        .collect();
    Selection { kept, stale }
}

#[derive(Debug, Deserialize)]
struct Model {
    id: Option<String>,
    #[serde(rename = "modelId")]
    model_id: Option<String>,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    downloads: u64,
    #[serde(rename = "trendingScore")]
    trending_score: Option<f64>,
    #[serde(rename = "lastModified")]
    last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
}

impl Model {
    fn resolved_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.model_id.as_deref()).filter(|id| !id.is_empty())
    }

    fn into_item(self, pipeline_tag: &str) -> Result<Item> {
        let id = match self.resolved_id() {
            Some(id) => id.to_string(),
            None => bail!("model without id"),
        };
        let summary = format!(
            "Pipeline: {}\nTags: {}\nLikes: {}, downloads: {}",
            pipeline_tag,
            self.tags.join(", "),
            self.likes,
            self.downloads
        );
        let published_at = self.last_modified.or(self.created_at).unwrap_or_else(Utc::now);
        let mut item = Item::new(
            ItemSource::HfTrending,
            &id,
            id.clone(),
            format!("{}/{}", HF_SITE_URL, id),
            summary,
            published_at,
        )?
        .with_metadata("likes", self.likes.to_string())
        .with_metadata("downloads", self.downloads.to_string());
        if let Some(score) = self.trending_score {
            item = item.with_metadata("trending_score", score.to_string());
        }
        Ok(item)
    }
}
