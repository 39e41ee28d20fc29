/*
research-monitor - single-run binary
Collects candidate items from the configured sources, judges their relevance with an LLM
under the provider's rate limits, writes a Markdown digest of the relevant ones and
optionally posts a short version to Slack.
*/

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use research_monitor::digest::{DigestAssembler, DigestEntry, MarkdownDigest, SlackSummary};
use research_monitor::executor::{CancelBatch, ExecutorConfig, RateLimitedBatchExecutor};
use research_monitor::judge::{InterestProfile, RelevanceJudge};
use research_monitor::llm::enrich::{enrich_entries, LlmEnricher};
use research_monitor::llm::{self, LlmProvider};
use research_monitor::notify::{Notifier, SlackWebhookNotifier};
use research_monitor::pipeline::FilterPipeline;
use research_monitor::seen::SeenTracker;
use research_monitor::sources::{self, GithubSource, HfPapersSource, HfTrendingSource, SourceAdapter};

const SOURCE_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "research-monitor", about = "Collect research items, filter them with an LLM and write a digest")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Look back this many days
    #[arg(long, default_value_t = 1)]
    days: i64,

    /// Digest output file (default: <output_dir>/digest_<date>.md)
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write collected items and filter results to the debug directory
    #[arg(long)]
    debug: bool,

    /// Collect and report items without judging them
    #[arg(long)]
    dry_run: bool,

    /// Remove seen-item artifacts older than this many days before running
    #[arg(long, value_name = "DAYS")]
    prune_days: Option<u32>,

    /// Do not post the digest to Slack
    #[arg(long)]
    no_slack: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config.clone() {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(default_path.as_path()) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    config.validate()?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    run(args, config).await
}

async fn run(args: Args, config: Config) -> Result<()> {
    let today = Utc::now();
    let since = today - ChronoDuration::days(args.days.max(1));
    info!(since = %since.format("%Y-%m-%d"), until = %today.format("%Y-%m-%d"), days = args.days, "run: period");

    let tracker = SeenTracker::open(config.paths.artifacts_dir()).await?;
    if let Some(days) = args.prune_days {
        tracker.prune_older_than(days).await?;
    }
    let seen = tracker.stats().await?;
    info!(total = seen.total, by_source = ?seen.by_source, "seen: known items");

    // Stage 1: collect
    let adapters = build_sources(&config)?;
    if adapters.is_empty() {
        warn!("no sources enabled, nothing to do");
        return Ok(());
    }
    let collected = sources::collect_items(&adapters, config.monitoring.max_items_per_source(), since).await;
    if args.debug {
        let path = write_collected(&config.paths.debug_dir(), &collected).await?;
        info!(path = %path.display(), "debug: collected items saved");
    }
    let (items, skipped) = tracker.filter_unseen(collected).await;
    info!(new = items.len(), already_seen = skipped, "run: items to judge");

    if args.dry_run {
        for item in &items {
            info!(id = %item.id, title = %item.title, "dry-run: would judge");
        }
        return Ok(());
    }
    if items.is_empty() {
        info!("no new items, skipping digest");
        return Ok(());
    }

    // Stage 2: judge
    let profile = Arc::new(InterestProfile::new(config.monitoring.load_interests().await?));
    let provider: Arc<dyn LlmProvider> = Arc::from(create_llm_provider(&config.llm)?);
    info!(model = provider.model(), "LLM provider initialized");
    let judge: Arc<dyn RelevanceJudge> = Arc::new(
        llm::judge::LlmJudge::new(provider.clone())
            .with_prompts(config.prompts.relevance_system.clone(), config.prompts.relevance_user.clone()),
    );
    let executor = RateLimitedBatchExecutor::new(ExecutorConfig::from(&config.rate_limit));
    let pipeline = FilterPipeline::new(judge, executor.clone(), config.monitoring.relevance_threshold())?;

    let cancel = CancelBatch::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("ctrl-c received, cancelling remaining judge calls");
                cancel.cancel();
            }
        })
    };
    let report = pipeline.run(items, profile, &cancel).await;

    if args.debug {
        let path = report.write_debug(&config.paths.debug_dir()).await?;
        info!(path = %path.display(), "debug: filter results saved");
    }
    tracker.record_report(&report).await?;
    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "some items were not judged; they will be retried next run");
    }
    let (kept, rejected, failed) = (report.kept.len(), report.rejected.len(), report.failures.len());

    // Stage 3: digest
    let entries: Vec<DigestEntry> = if config.digest.enrich() && !report.kept.is_empty() && !cancel.is_cancelled() {
        let enricher = LlmEnricher::new(provider)
            .with_prompts(config.prompts.enrich_system.clone(), config.prompts.enrich_user.clone())
            .with_max_highlights(config.digest.max_highlights());
        enrich_entries(Arc::new(enricher), &executor, report.kept, &cancel).await
    } else {
        report.kept.into_iter().map(DigestEntry::from).collect()
    };
    ctrl_c.abort();

    let digest_title = config.digest.title.clone().unwrap_or_else(|| "Research digest".to_string());
    let digest = MarkdownDigest::new(digest_title).render(&entries, today.date_naive());
    let output = args.output.unwrap_or_else(|| {
        config
            .paths
            .output_dir()
            .join(format!("digest_{}.md", today.format("%Y-%m-%d")))
    });
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    tokio::fs::write(&output, digest)
        .await
        .with_context(|| format!("Failed to write digest: {}", output.display()))?;
    info!(path = %output.display(), kept, rejected, failed, "digest written");

    if !entries.is_empty() {
        if let Some((notifier, max_entries)) = build_notifier(&config, args.no_slack)? {
            let message = SlackSummary::new(max_entries).render(&entries, today.date_naive());
            if let Err(e) = notifier.send_digest(&message, today.date_naive()).await {
                warn!(notifier = notifier.name(), error = %format!("{:#}", e), "notify: sending digest failed");
            }
        }
    }

    if cancel.is_cancelled() {
        anyhow::bail!("run interrupted; digest contains only items judged before cancellation");
    }
    Ok(())
}

fn build_sources(config: &Config) -> Result<Vec<Box<dyn SourceAdapter>>> {
    let client = sources::http_client(SOURCE_HTTP_TIMEOUT_SECS)?;
    let keywords = config.sources.keywords.clone();
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    let github = config.sources.github.clone().unwrap_or_default();
    if github.enabled.unwrap_or(true) {
        let token = match github.token_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(token) => Some(token),
                Err(_) => {
                    warn!(env = var, "GitHub token env var not set, using anonymous access");
                    None
                }
            },
            None => None,
        };
        adapters.push(Box::new(
            GithubSource::new(
                client.clone(),
                github.api_url.as_deref().unwrap_or(sources::github::DEFAULT_API_URL),
                github.topics,
            )
            .with_token(token)
            .with_min_stars(github.min_stars.unwrap_or(0))
            .with_max_items(github.max_items),
        ));
    }

    let papers = config.sources.hf_papers.clone().unwrap_or_default();
    if papers.enabled.unwrap_or(true) {
        adapters.push(Box::new(
            HfPapersSource::new(
                client.clone(),
                papers.api_url.as_deref().unwrap_or(sources::hf_papers::DEFAULT_API_URL),
            )
            .with_keyword_filter(papers.filter_by_keywords.unwrap_or(true), keywords)
            .with_max_items(papers.max_items),
        ));
    }

    let trending = config.sources.hf_trending.clone().unwrap_or_default();
    if trending.enabled.unwrap_or(true) {
        adapters.push(Box::new(
            HfTrendingSource::new(
                client,
                trending.api_url.as_deref().unwrap_or(sources::hf_trending::DEFAULT_API_URL),
                trending
                    .pipeline_tag
                    .as_deref()
                    .unwrap_or(sources::hf_trending::DEFAULT_PIPELINE_TAG),
            )
            .with_max_days_old(Some(
                trending.max_days_old.unwrap_or(sources::hf_trending::DEFAULT_MAX_DAYS_OLD),
            ))
            .with_max_items(trending.max_items),
        ));
    }

    Ok(adapters)
}

/// Slack notifier, when enabled and its webhook env var is set.
fn build_notifier(config: &Config, no_slack: bool) -> Result<Option<(Box<dyn Notifier>, usize)>> {
    let Some(slack) = config.notifications.slack.as_ref() else {
        return Ok(None);
    };
    if no_slack || !slack.enabled.unwrap_or(true) {
        info!("notify: Slack disabled");
        return Ok(None);
    }
    let var = slack.webhook_url_env();
    let webhook_url = match std::env::var(var) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            warn!(env = var, "notify: Slack webhook env var not set, skipping notification");
            return Ok(None);
        }
    };
    let client = sources::http_client(SOURCE_HTTP_TIMEOUT_SECS)?;
    Ok(Some((
        Box::new(SlackWebhookNotifier::new(client, webhook_url)),
        slack.max_entries(),
    )))
}

fn create_llm_provider(llm_config: &common::LlmConfig) -> Result<Box<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("anthropic");
    let api_key_env = llm_config.api_key_env.as_deref().unwrap_or(match adapter {
        "openai" => "OPENAI_API_KEY",
        _ => "ANTHROPIC_API_KEY",
    });
    let api_key = std::env::var(api_key_env).with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;
    let timeout_secs = llm_config.timeout_seconds.unwrap_or(60);
    let max_tokens = llm_config.max_tokens.unwrap_or(1024);
    let temperature = llm_config.temperature.unwrap_or(0.2);

    match adapter {
        "anthropic" => {
            let provider = llm::anthropic::AnthropicProvider::new(
                llm_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| llm::anthropic::DEFAULT_API_URL.to_string()),
                api_key,
                llm_config
                    .model
                    .clone()
                    .unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
            )
            .with_defaults(timeout_secs, max_tokens, temperature);
            Ok(Box::new(provider))
        }
        "openai" => {
            let provider = llm::remote::OpenAiCompatibleProvider::new(
                llm_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
                api_key,
                llm_config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            )
            .with_defaults(timeout_secs, max_tokens, temperature);
            Ok(Box::new(provider))
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}

async fn write_collected(dir: &std::path::Path, items: &[research_monitor::Item]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create debug directory: {}", dir.display()))?;
    let path = dir.join(format!("collected_items_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
    tokio::fs::write(&path, serde_json::to_string_pretty(items)?)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from(["research-monitor", "--days", "3", "--prune-days", "30", "--no-slack"]).unwrap();
        assert_eq!(args.days, 3);
        assert_eq!(args.prune_days, Some(30));
        assert!(args.no_slack);
        assert!(!args.dry_run);
    }

    #[test]
    fn negative_prune_days_is_rejected() {
        assert!(Args::try_parse_from(["research-monitor", "--prune-days", "-5"]).is_err());
        assert!(Args::try_parse_from(["research-monitor", "--prune-days=-1"]).is_err());
    }

    #[test]
    fn slack_is_off_without_section_or_with_flag() {
        assert!(build_notifier(&Config::default(), false).unwrap().is_none());

        let config = Config {
            notifications: common::NotificationsConfig {
                slack: Some(common::SlackConfig {
                    webhook_url_env: Some("RESEARCH_MONITOR_TEST_HOOK".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        };
        assert!(build_notifier(&config, true).unwrap().is_none());
        // enabled, but the env var is unset
        assert!(build_notifier(&config, false).unwrap().is_none());
    }
}
