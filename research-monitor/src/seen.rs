use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::item::{Item, ItemSource};
use crate::judge::Verdict;
use crate::pipeline::FilterReport;

const SLUG_MAX_CHARS: usize = 50;
const PREVIEW_CHARS: usize = 500;

/// What is stored for every item that went through the filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub title: String,
    pub url: String,
    pub source: ItemSource,
    pub published_at: DateTime<Utc>,
    pub date_seen: NaiveDate,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub summary_preview: String,
    pub relevance_checked: bool,
    pub relevance_score: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeenStats {
    pub total: usize,
    pub by_source: BTreeMap<String, usize>,
}

/// Remembers which items were already judged, one JSON file per item under
/// `<root>/<source_tag>/`.
pub struct SeenTracker {
    root: PathBuf,
}

impl SeenTracker {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for source in ItemSource::ALL {
            let dir = root.join(source.tag());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create artifacts directory: {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    pub fn artifact_path(&self, item: &Item) -> PathBuf {
        let name = format!("{}_{}.json", slug(&item.title), url_hash(&item.url));
        self.root.join(item.source.tag()).join(name)
    }

    pub async fn is_seen(&self, item: &Item) -> bool {
        tokio::fs::try_exists(self.artifact_path(item)).await.unwrap_or(false)
    }

    /// Split off items already recorded. Returns the unseen items and how many were skipped.
    pub async fn filter_unseen(&self, items: Vec<Item>) -> (Vec<Item>, usize) {
        let mut unseen = Vec::with_capacity(items.len());
        let mut skipped = 0;
        for item in items {
            if self.is_seen(&item).await {
                skipped += 1;
            } else {
                unseen.push(item);
            }
        }
        debug!(unseen = unseen.len(), skipped, "seen: filtered known items");
        (unseen, skipped)
    }

    pub async fn record(&self, item: &Item, verdict: Option<&Verdict>) -> Result<PathBuf> {
        self.write_artifact(item, verdict, Utc::now().date_naive()).await
    }

    /// Record every judged item. Failed items stay unseen so the next run retries them.
    pub async fn record_report(&self, report: &FilterReport) -> Result<usize> {
        let mut written = 0;
        for scored in report.judged() {
            self.record(&scored.item, Some(&scored.verdict)).await?;
            written += 1;
        }
        info!(written, unrecorded_failures = report.failures.len(), "seen: recorded judged items");
        Ok(written)
    }

    pub async fn stats(&self) -> Result<SeenStats> {
        let mut stats = SeenStats::default();
        for source in ItemSource::ALL {
            let count = self.artifact_files(source).await?.len();
            stats.total += count;
            stats.by_source.insert(source.tag().to_string(), count);
        }
        Ok(stats)
    }

    /// Delete artifacts first seen more than `days` days ago. Unreadable files are left alone.
    pub async fn prune_older_than(&self, days: u32) -> Result<usize> {
        let today = Utc::now().date_naive();
        let mut removed = 0;
        for source in ItemSource::ALL {
            for path in self.artifact_files(source).await? {
                let artifact = match read_artifact(&path).await {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(path = %path.display(), error = %format!("{:#}", e), "seen: unreadable artifact");
                        continue;
                    }
                };
                if (today - artifact.date_seen).num_days() > i64::from(days) {
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("Failed to remove artifact: {}", path.display()))?;
                    removed += 1;
                }
            }
        }
        info!(removed, days, "seen: pruned old artifacts");
        Ok(removed)
    }

    async fn write_artifact(&self, item: &Item, verdict: Option<&Verdict>, date_seen: NaiveDate) -> Result<PathBuf> {
        let artifact = Artifact {
            id: item.id.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            source: item.source,
            published_at: item.published_at,
            date_seen,
            metadata: item.metadata.clone(),
            summary_preview: item.summary.chars().take(PREVIEW_CHARS).collect(),
            relevance_checked: verdict.is_some(),
            relevance_score: verdict.map(|v| v.score),
            reason: verdict.map(|v| v.rationale.clone()),
        };
        let path = self.artifact_path(item);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&artifact)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        Ok(path)
    }

    async fn artifact_files(&self, source: ItemSource) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(source.tag());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

async fn read_artifact(path: &Path) -> Result<Artifact> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

/// Filesystem-safe prefix built from a title.
fn slug(title: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }
    let slug: String = out.chars().take(SLUG_MAX_CHARS).collect();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

/// First 8 hex chars of the url's SHA-256, stable across runs and toolchains.
fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut out = String::with_capacity(8);
    for b in digest.iter().take(4) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
