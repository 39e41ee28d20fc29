use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::executor::{CallError, CancelBatch, JudgeCall, RateLimitedBatchExecutor};
use crate::item::Item;
use crate::judge::{InterestProfile, RelevanceJudge, Verdict};

/// An item together with the verdict it received
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    pub item: Item,
    pub verdict: Verdict,
    pub attempts: u32,
}

/// An item whose judging ended without a verdict
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item: Item,
    pub error: String,
    pub attempts: u32,
    pub cancelled: bool,
}

/// Outcome of one filtering pass. Every submitted item lands in exactly one list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterReport {
    pub threshold: f64,
    /// At or above threshold, in input order
    pub kept: Vec<ScoredItem>,
    /// Below threshold, in input order
    pub rejected: Vec<ScoredItem>,
    pub failures: Vec<ItemFailure>,
}

impl FilterReport {
    pub fn total(&self) -> usize {
        self.kept.len() + self.rejected.len() + self.failures.len()
    }

    /// Items that received a verdict (kept or rejected)
    pub fn judged(&self) -> impl Iterator<Item = &ScoredItem> {
        self.kept.iter().chain(self.rejected.iter())
    }

    /// Write a JSON snapshot of this pass into `dir` and return the file path.
    pub async fn write_debug(&self, dir: &Path) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct Row<'a> {
            id: &'a str,
            title: &'a str,
            url: &'a str,
            source: &'a str,
            score: f64,
            kept: bool,
            rationale: &'a str,
        }

        #[derive(Serialize)]
        struct Snapshot<'a> {
            threshold: f64,
            total_checked: usize,
            relevant_count: usize,
            failed_count: usize,
            results: Vec<Row<'a>>,
            failures: &'a [ItemFailure],
        }

        let mut results: Vec<Row<'_>> = self
            .kept
            .iter()
            .map(|s| (s, true))
            .chain(self.rejected.iter().map(|s| (s, false)))
            .map(|(s, kept)| Row {
                id: &s.item.id,
                title: &s.item.title,
                url: &s.item.url,
                source: s.item.source.tag(),
                score: s.verdict.score,
                kept,
                rationale: &s.verdict.rationale,
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));

        let snapshot = Snapshot {
            threshold: self.threshold,
            total_checked: self.kept.len() + self.rejected.len(),
            relevant_count: self.kept.len(),
            failed_count: self.failures.len(),
            results,
            failures: &self.failures,
        };

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create debug directory: {}", dir.display()))?;
        let path = dir.join(format!("filter_results_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write debug snapshot: {}", path.display()))?;
        Ok(path)
    }
}

/// Judges a batch of items and keeps the ones scoring at or above the threshold.
pub struct FilterPipeline {
    judge: Arc<dyn RelevanceJudge>,
    executor: RateLimitedBatchExecutor,
    threshold: f64,
}

impl FilterPipeline {
    pub fn new(judge: Arc<dyn RelevanceJudge>, executor: RateLimitedBatchExecutor, threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("relevance threshold must be within [0, 1], got {}", threshold);
        }
        Ok(Self {
            judge,
            executor,
            threshold,
        })
    }

    /// Inclusive: a score equal to the threshold is kept.
    pub fn passes(&self, verdict: &Verdict) -> bool {
        verdict.score >= self.threshold
    }

    pub async fn run(&self, items: Vec<Item>, profile: Arc<InterestProfile>, cancel: &CancelBatch) -> FilterReport {
        info!(
            items = items.len(),
            threshold = self.threshold,
            judge = self.judge.name(),
            "pipeline: judging items"
        );

        let items: Vec<Arc<Item>> = items.into_iter().map(Arc::new).collect();
        let calls: Vec<JudgeCall> = items
            .iter()
            .map(|item| {
                let judge = self.judge.clone();
                let item = item.clone();
                let profile = profile.clone();
                JudgeCall::new(item.id.clone(), move || {
                    let judge = judge.clone();
                    let item = item.clone();
                    let profile = profile.clone();
                    async move { judge.evaluate(&item, &profile).await }
                })
            })
            .collect();

        let outcomes = self.executor.run_all(calls, cancel).await;

        let mut report = FilterReport {
            threshold: self.threshold,
            ..Default::default()
        };
        for (item, outcome) in items.into_iter().zip(outcomes) {
            let attempts = outcome.attempt_count();
            let item = Arc::try_unwrap(item).unwrap_or_else(|shared| (*shared).clone());
            match outcome.result {
                Ok(verdict) => {
                    let keep = self.passes(&verdict);
                    debug!(id = %item.id, score = verdict.score, keep, "pipeline: verdict");
                    let scored = ScoredItem { item, verdict, attempts };
                    if keep {
                        report.kept.push(scored);
                    } else {
                        report.rejected.push(scored);
                    }
                }
                Err(error) => {
                    let cancelled = matches!(error, CallError::BatchCancelled);
                    if !cancelled {
                        warn!(id = %item.id, attempts, error = %error, "pipeline: judging failed");
                    }
                    report.failures.push(ItemFailure {
                        item,
                        error: error.to_string(),
                        attempts,
                        cancelled,
                    });
                }
            }
        }

        info!(
            kept = report.kept.len(),
            rejected = report.rejected.len(),
            failed = report.failures.len(),
            "pipeline: filtering finished"
        );
        report
    }
}
