use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::item::Item;

/// Free-text description of what the reader cares about.
/// Loaded once per run and shared read-only by every judge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestProfile(String);

impl InterestProfile {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterestProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relevance score and rationale for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub item_id: String,
    /// 0.0 to 1.0
    pub score: f64,
    pub rationale: String,
}

/// Failure kinds a judge may report. Only `RateLimited` is retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("judge error: {0}")]
    Failed(String),
}

impl JudgeError {
    pub fn failed(message: impl Into<String>) -> Self {
        JudgeError::Failed(message.into())
    }
}

/// Scores one item against an interest profile.
#[async_trait::async_trait]
pub trait RelevanceJudge: Send + Sync {
    async fn evaluate(&self, item: &Item, profile: &InterestProfile) -> Result<Verdict, JudgeError>;

    /// Name for diagnostics
    fn name(&self) -> &str {
        "judge"
    }
}
