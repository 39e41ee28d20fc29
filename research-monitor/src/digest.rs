use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::item::{Item, ItemSource};
use crate::judge::Verdict;
use crate::pipeline::ScoredItem;

/// LLM-written digest text for one kept item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub summary: String,
    #[serde(default)]
    pub highlights: Vec<String>,
}

/// One kept item as it appears in a digest. `enrichment` is `None` when it was
/// disabled or failed for this item.
#[derive(Debug, Clone, Serialize)]
pub struct DigestEntry {
    pub item: Item,
    pub verdict: Verdict,
    pub enrichment: Option<Enrichment>,
}

impl From<ScoredItem> for DigestEntry {
    fn from(scored: ScoredItem) -> Self {
        Self {
            item: scored.item,
            verdict: scored.verdict,
            enrichment: None,
        }
    }
}

/// Turns the kept items of a run into a document.
pub trait DigestAssembler {
    fn render(&self, entries: &[DigestEntry], date: NaiveDate) -> String;
}

/// Section order in the rendered digest
const SECTIONS: [ItemSource; 3] = [ItemSource::HfPapers, ItemSource::HfTrending, ItemSource::Github];

fn section_heading(source: ItemSource) -> &'static str {
    match source {
        ItemSource::HfPapers => "Papers",
        ItemSource::HfTrending => "Models",
        ItemSource::Github => "Repositories",
    }
}

/// Entries of one source, best score first; equal scores keep input order.
fn section(entries: &[DigestEntry], source: ItemSource) -> Vec<&DigestEntry> {
    let mut group: Vec<&DigestEntry> = entries.iter().filter(|e| e.item.source == source).collect();
    group.sort_by(|a, b| b.verdict.score.total_cmp(&a.verdict.score));
    group
}

/// Markdown digest: one section per source, best scores first.
#[derive(Debug, Clone)]
pub struct MarkdownDigest {
    title: String,
}

impl Default for MarkdownDigest {
    fn default() -> Self {
        Self {
            title: "Research digest".to_string(),
        }
    }
}

impl MarkdownDigest {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into() }
    }

    fn write_entry(out: &mut String, entry: &DigestEntry) {
        let item = &entry.item;
        let _ = writeln!(out, "### [{}]({})\n", item.title, item.url);
        let _ = writeln!(out, "**Relevance:** {:.1}%\n", entry.verdict.score * 100.0);

        match &entry.enrichment {
            Some(enrichment) => {
                if !enrichment.summary.is_empty() {
                    let _ = writeln!(out, "{}\n", enrichment.summary);
                }
                if !enrichment.highlights.is_empty() {
                    out.push_str("**Highlights:**\n\n");
                    for highlight in &enrichment.highlights {
                        let _ = writeln!(out, "- {}", highlight);
                    }
                    out.push('\n');
                }
                if !entry.verdict.rationale.is_empty() {
                    let _ = writeln!(out, "*Why:* {}\n", entry.verdict.rationale);
                }
            }
            None => {
                if !entry.verdict.rationale.is_empty() {
                    let _ = writeln!(out, "{}\n", entry.verdict.rationale);
                }
            }
        }

        let meta: Vec<String> = item
            .metadata
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        if !meta.is_empty() {
            let _ = writeln!(out, "*{}*\n", meta.join(" | "));
        }
        out.push_str("---\n\n");
    }
}

impl DigestAssembler for MarkdownDigest {
    fn render(&self, entries: &[DigestEntry], date: NaiveDate) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {} for {}\n", self.title, date.format("%Y-%m-%d"));
        if entries.is_empty() {
            out.push_str("No relevant items found.\n");
            return out;
        }
        let _ = writeln!(out, "Items found: {}\n", entries.len());

        for source in SECTIONS {
            let group = section(entries, source);
            if group.is_empty() {
                continue;
            }
            let _ = writeln!(out, "## {}\n", section_heading(source));
            for entry in group {
                Self::write_entry(&mut out, entry);
            }
        }
        out
    }
}

/// Short Slack `mrkdwn` message: counts per section and the best entries as links.
#[derive(Debug, Clone)]
pub struct SlackSummary {
    max_entries: usize,
}

impl SlackSummary {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

impl DigestAssembler for SlackSummary {
    fn render(&self, entries: &[DigestEntry], date: NaiveDate) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "*Research digest for {}*", date.format("%d.%m.%Y"));
        if entries.is_empty() {
            out.push_str("No relevant items found.");
            return out;
        }

        let counts: Vec<String> = SECTIONS
            .iter()
            .map(|&source| (source, section(entries, source).len()))
            .filter(|(_, n)| *n > 0)
            .map(|(source, n)| format!("{}: {}", section_heading(source), n))
            .collect();
        let _ = writeln!(out, "{} relevant items ({})\n", entries.len(), counts.join(", "));

        let mut best: Vec<&DigestEntry> = entries.iter().collect();
        best.sort_by(|a, b| b.verdict.score.total_cmp(&a.verdict.score));
        for entry in best.iter().take(self.max_entries) {
            let _ = writeln!(
                out,
                "• <{}|{}> ({:.0}%)",
                entry.item.url,
                entry.item.title.replace(&['<', '>', '|'][..], " "),
                entry.verdict.score * 100.0
            );
        }
        if entries.len() > self.max_entries {
            let _ = writeln!(out, "…and {} more", entries.len() - self.max_entries);
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(source: ItemSource, id: &str, score: f64) -> DigestEntry {
        let item = Item::new(source, id, format!("Title {}", id), format!("https://example.com/{}", id), "", Utc::now())
            .unwrap()
            .with_metadata("stars", "12");
        DigestEntry {
            verdict: Verdict {
                item_id: item.id.clone(),
                score,
                rationale: format!("why {}", id),
            },
            item,
            enrichment: None,
        }
    }

    #[test]
    fn empty_digest_says_so() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let out = MarkdownDigest::default().render(&[], date);
        assert!(out.starts_with("# Research digest for 2026-03-14"));
        assert!(out.contains("No relevant items found."));
    }

    #[test]
    fn groups_by_source_and_sorts_by_score() {
        let entries = vec![
            entry(ItemSource::Github, "low", 0.61),
            entry(ItemSource::HfPapers, "paper", 0.7),
            entry(ItemSource::Github, "high", 0.95),
        ];
        let out = MarkdownDigest::new("Speech digest").render(&entries, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());

        let papers = out.find("## Papers").unwrap();
        let repos = out.find("## Repositories").unwrap();
        assert!(papers < repos);
        assert!(!out.contains("## Models"));

        let high = out.find("[Title high]").unwrap();
        let low = out.find("[Title low]").unwrap();
        assert!(repos < high && high < low);

        assert!(out.contains("**Relevance:** 95.0%"));
        assert!(out.contains("why paper"));
        assert!(out.contains("*stars: 12*"));
        assert!(out.contains("Items found: 3"));
    }

    #[test]
    fn enriched_entry_shows_summary_and_highlights() {
        let mut enriched = entry(ItemSource::HfPapers, "paper", 0.8);
        enriched.enrichment = Some(Enrichment {
            summary: "A faster vocoder.".to_string(),
            highlights: vec!["2x speedup".to_string(), "open weights".to_string()],
        });
        let out = MarkdownDigest::default().render(&[enriched], NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());

        assert!(out.contains("A faster vocoder.\n"));
        assert!(out.contains("**Highlights:**\n\n- 2x speedup\n- open weights\n"));
        assert!(out.contains("*Why:* why paper"));
    }

    #[test]
    fn slack_summary_lists_best_entries() {
        let entries = vec![
            entry(ItemSource::Github, "repo", 0.65),
            entry(ItemSource::HfPapers, "paper", 0.9),
            entry(ItemSource::HfTrending, "model", 0.7),
        ];
        let out = SlackSummary::new(2).render(&entries, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());

        assert!(out.starts_with("*Research digest for 14.03.2026*"));
        assert!(out.contains("3 relevant items (Papers: 1, Models: 1, Repositories: 1)"));
        let paper = out.find("<https://example.com/paper|Title paper> (90%)").unwrap();
        let model = out.find("<https://example.com/model|Title model> (70%)").unwrap();
        assert!(paper < model);
        assert!(!out.contains("Title repo"));
        assert!(out.ends_with("…and 1 more"));

        let empty = SlackSummary::new(5).render(&[], NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
        assert!(empty.ends_with("No relevant items found."));
    }
}
