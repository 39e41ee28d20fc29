use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Where an item was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Github,
    HfPapers,
    HfTrending,
}

impl ItemSource {
    pub const ALL: [ItemSource; 3] = [ItemSource::Github, ItemSource::HfPapers, ItemSource::HfTrending];

    /// Stable tag used in ids, artifact paths and logs
    pub fn tag(self) -> &'static str {
        match self {
            ItemSource::Github => "github",
            ItemSource::HfPapers => "hf_papers",
            ItemSource::HfTrending => "hf_trending",
        }
    }
}

impl fmt::Display for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One candidate repository, paper or model. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Source-qualified id, e.g. `github:owner/repo`
    pub id: String,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub source: ItemSource,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Item {
    pub fn new(
        source: ItemSource,
        native_id: &str,
        title: impl Into<String>,
        url: impl Into<String>,
        summary: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Result<Self> {
        let title = title.into();
        let url = url.into();
        if native_id.trim().is_empty() {
            bail!("item id cannot be empty");
        }
        if title.trim().is_empty() {
            bail!("item title cannot be empty ({}:{})", source, native_id);
        }
        if url.trim().is_empty() {
            bail!("item url cannot be empty ({}:{})", source, native_id);
        }
        Ok(Self {
            id: format!("{}:{}", source.tag(), native_id),
            title,
            url,
            summary: summary.into(),
            source,
            published_at,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Drop repeated ids, keeping the first occurrence and the original order.
pub fn dedup_by_id(items: Vec<Item>) -> Vec<Item> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: ItemSource, id: &str) -> Item {
        Item::new(source, id, format!("Title {}", id), format!("https://example.com/{}", id), "", Utc::now())
            .expect("valid item")
    }

    #[test]
    fn id_is_source_qualified() {
        let it = item(ItemSource::HfPapers, "2401.00001");
        assert_eq!(it.id, "hf_papers:2401.00001");
        assert_eq!(it.source.to_string(), "hf_papers");
    }

    #[test]
    fn rejects_empty_title_or_url() {
        assert!(Item::new(ItemSource::Github, "a/b", "", "https://x", "", Utc::now()).is_err());
        assert!(Item::new(ItemSource::Github, "a/b", "a/b", " ", "", Utc::now()).is_err());
        assert!(Item::new(ItemSource::Github, "", "a/b", "https://x", "", Utc::now()).is_err());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let first = item(ItemSource::Github, "a/b").with_metadata("stars", "10");
        let items = vec![
            first.clone(),
            item(ItemSource::HfTrending, "a/b"),
            item(ItemSource::Github, "a/b"),
            item(ItemSource::Github, "c/d"),
        ];
        let deduped = dedup_by_id(items);
        let ids: Vec<_> = deduped.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["github:a/b", "hf_trending:a/b", "github:c/d"]);
        assert_eq!(deduped[0].metadata.get("stars").map(String::as_str), Some("10"));
    }

    #[test]
    fn source_serializes_snake_case() {
        let json = serde_json::to_string(&ItemSource::HfTrending).unwrap();
        assert_eq!(json, "\"hf_trending\"");
    }
}
