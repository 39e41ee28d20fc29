use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{matches_keywords, truncate_chars, SourceAdapter, HF_SITE_URL};
use crate::item::{Item, ItemSource};

pub const DEFAULT_API_URL: &str = "https://huggingface.co";
/// Days looked back at most, whatever `since` says
const MAX_DAYS: i64 = 31;
const MAX_SUMMARY_CHARS: usize = 10_000;

/// Hugging Face daily papers, one request per day.
pub struct HfPapersSource {
    api_url: String,
    keywords: Vec<String>,
    filter_by_keywords: bool,
    max_items: Option<usize>,
    client: Client,
}

impl HfPapersSource {
    pub fn new(client: Client, api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            keywords: Vec::new(),
            filter_by_keywords: false,
            max_items: None,
            client,
        }
    }

    /// Keep only papers mentioning one of `keywords` when `enabled`
    pub fn with_keyword_filter(mut self, enabled: bool, keywords: Vec<String>) -> Self {
        self.filter_by_keywords = enabled;
        self.keywords = keywords;
        self
    }

    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    async fn fetch_day(&self, day: NaiveDate) -> Result<Vec<DailyPaper>> {
        let url = format!("{}/api/daily_papers", self.api_url);
        let response = self
            .client
            .get(&url)
            .query(&[("date", day.format("%Y-%m-%d").to_string())])
            .send()
            .await
            .context("network error during daily papers fetch")?;
        let status = response.status();
        if !status.is_success() {
            bail!("daily papers for {} failed with status {}", day, status);
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to parse daily papers for {}", day))
    }
}

/// Days from `today` back to `since`, newest first.
fn days_between(since: DateTime<Utc>, today: NaiveDate) -> Vec<NaiveDate> {
    let first = since.date_naive().max(today - ChronoDuration::days(MAX_DAYS - 1));
    let mut days = Vec::new();
    let mut day = today;
    while day >= first {
        days.push(day);
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    days
}

#[async_trait::async_trait]
impl SourceAdapter for HfPapersSource {
    fn source(&self) -> ItemSource {
        ItemSource::HfPapers
    }

    async fn fetch(&self, max_items: usize, since: DateTime<Utc>) -> Result<Vec<Item>> {
        let limit = self.max_items.map_or(max_items, |cap| cap.min(max_items));
        let days = days_between(since, Utc::now().date_naive());

        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut filtered = 0usize;
        let mut failures = 0usize;
        'days: for day in &days {
            let papers = match self.fetch_day(*day).await {
                Ok(papers) => papers,
                Err(e) => {
                    warn!(date = %day, error = %format!("{:#}", e), "hf_papers: day fetch failed");
                    failures += 1;
                    continue;
                }
            };
            let mut day_count = 0;
            for entry in papers {
                if items.len() >= limit {
                    break 'days;
                }
                let paper = entry.paper;
                if !seen.insert(paper.id.clone()) {
                    continue;
                }
                let title = entry.title.or(paper.title).unwrap_or_default();
                let summary = entry.summary.or(paper.summary).unwrap_or_default();
                if self.filter_by_keywords && !matches_keywords(&title, &summary, &self.keywords) {
                    filtered += 1;
                    continue;
                }
                let published_at = paper
                    .published_at
                    .unwrap_or_else(|| day.and_time(NaiveTime::MIN).and_utc());
                let url = format!("{}/papers/{}", HF_SITE_URL, paper.id);
                match Item::new(
                    ItemSource::HfPapers,
                    &paper.id,
                    title.trim(),
                    url,
                    truncate_chars(summary.trim(), MAX_SUMMARY_CHARS),
                    published_at,
                ) {
                    Ok(item) => {
                        items.push(
                            item.with_metadata("upvotes", paper.upvotes.to_string())
                                .with_metadata("published_date", day.to_string()),
                        );
                        day_count += 1;
                    }
                    Err(e) => debug!(error = %e, "hf_papers: skipping paper"),
                }
            }
            debug!(date = %day, count = day_count, "hf_papers: day processed");
        }

        if !days.is_empty() && failures == days.len() {
            bail!("daily papers fetch failed for all {} days", failures);
        }
        if filtered > 0 {
            info!(filtered, "hf_papers: papers dropped by keyword filter");
        }
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct DailyPaper {
    paper: Paper,
    title: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Paper {
    id: String,
    title: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    upvotes: i64,
    #[serde(rename = "publishedAt")]
    published_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_range_is_inclusive_and_newest_first() {
        let today = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
        let since = Utc.with_ymd_and_hms(2026, 5, 8, 18, 30, 0).unwrap();
        let days: Vec<String> = days_between(since, today).iter().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2026-05-10", "2026-05-09", "2026-05-08"]);
    }

    #[test]
    fn day_range_is_capped() {
        let today = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(days_between(since, today).len(), MAX_DAYS as usize);
    }

    #[test]
    fn future_since_yields_no_days() {
        let today = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
        let since = Utc.with_ymd_and_hms(2026, 5, 12, 0, 0, 0).unwrap();
        assert!(days_between(since, today).is_empty());
    }
}
